//! Tracking facade: [`Registry`], [`Tracker`], [`People`] and [`Group`]

mod group;
mod people;
mod registry;
mod session;
mod tracker;

pub use group::Group;
pub use people::People;
pub use registry::Registry;
pub use session::SessionMetadata;
pub use tracker::Tracker;
