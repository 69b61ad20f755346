
pub mod utility;
pub mod hc;
pub mod name;
pub mod level;
pub mod universe;
pub mod expr;
pub mod builtin;
pub mod context;
pub mod subst;
pub mod metavar;
pub mod justification;
pub mod constraint;
pub mod normalize;
pub mod infer;
pub mod env;
pub mod serialize;
pub mod error;

pub mod prelude {
    pub use crate::{
        builtin,
        constraint::*,
        context::*,
        env::*,
        error::*,
        expr::*,
        hc::*,
        infer::*,
        justification::*,
        level::*,
        metavar::*,
        name::*,
        normalize::*,
        subst,
        universe::*,
        utility::*,
    };
}
