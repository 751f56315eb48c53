//! HTTP handlers for the admin surface.

pub mod rooms;
pub mod workers;

pub use rooms::{
    get_room, join_room, leave_room, list_rooms, play_in_room, set_room_volume, stop_room,
};
pub use workers::list_workers;
