//! Terminal output for builds
//!
//! Step lines, spinners and banners. Interactive terminals get `cliclack`
//! and `indicatif` rendering; CI and pipes get plain prefixed lines.
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect().with_quiet(args.quiet);
//!
//! ui::build_step(&ctx, "run", &["make".to_string()]);
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Pulling debian...");
//! spinner.stop("Pulled debian");
//! ```

mod context;
mod output;
mod progress;
mod theme;

pub use context::UiContext;
pub use output::{
    build_step, cache_hit, intro, outro_error, outro_success, remark, step_error,
    step_ok,
};
pub use progress::{BuildProgress, TaskSpinner};
pub use theme::{init_theme, KilnTheme, Mark};
