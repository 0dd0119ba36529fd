//! # pwakit page client
//!
//! The update coordinator runs inside a page. It registers the cache
//! controller, turns lifecycle events and `UPDATE_AVAILABLE` messages into
//! banners, and decides when the page reloads.
//!
//! The DOM is abstracted behind [`PageUi`], so the same coordinator drives a
//! console front end or a recording test double.

pub mod coordinator;
pub mod ui;

pub use coordinator::{CoordinatorPhase, UpdateCoordinator};
pub use ui::{Banner, BannerKind, PageUi, DEFAULT_DESCRIPTION};
