//! Scene loading for the qnet engine.
//!
//! A scene file describes a network (nodes, links), simulation settings and
//! a script of messages and key requests. [`build_scene`] turns it into a
//! running [`qnet_core::engine::Engine`] wrapped in an [`ActiveScene`] that
//! injects the script at the right ticks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use qnet_scene::build_scene;
//!
//! let mut scene = build_scene(Path::new("scenes/reference_hybrid.ron"))?;
//! let events = scene.run_to_completion()?;
//! println!("trace hash {:#018x}", scene.engine.trace_hash());
//! ```

pub mod error;
pub mod scene_builder;
pub mod scene_schema;

pub use error::SceneError;
pub use scene_builder::{ActiveScene, LinkMeta, NodeMeta, ScheduledAction, build_scene, build_scene_data};
pub use scene_schema::{SceneData, SceneFormat};
