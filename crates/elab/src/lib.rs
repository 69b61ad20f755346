
pub mod queue;
pub mod plugin;
pub mod elaborator;
pub mod error;

pub mod prelude {
    pub use crate::{
        elaborator::{ElabOptions, Elaborator},
        error::ElabError,
        plugin::{ElaboratorPlugin, PluginAlternatives, Synthesizer},
        queue::CnstrQueue,
    };
}
