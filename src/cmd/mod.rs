//! CLI command implementations.
//!
//! | Module     | Commands handled        |
//! |------------|-------------------------|
//! | `serve`    | `Serve`, `InitDb`       |
//! | `run`      | `Run`                   |
//! | `generate` | `Generate`              |
//! | `config`   | `Config`                |

pub mod config;
pub mod generate;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use generate::cmd_generate;
pub use run::cmd_run;
pub use serve::{cmd_init_db, cmd_serve};
