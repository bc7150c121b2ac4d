//! Infrastructure job runner.
//!
//! ## Overview
//!
//! A job is one request to run `plan`, `apply` or `destroy` against a piece
//! of configuration source. Jobs are stored in SQLite, executed by spawning
//! the infrastructure CLI in a disposable per-job workspace, and tracked
//! through `PENDING -> RUNNING -> COMPLETED | FAILED | CANCELLED`.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ JobService::execute()                  │
//!                       │         v                                        │
//!                       │  service.rs  (per-job locks, worker pool)        │
//!                       │         │                                        │
//!                       │         │ ExecutionEngine::run()                 │
//!                       │         v                                        │
//!                       │  engine.rs  (init + command stages, timeouts,    │
//!                       │              process-group kill)                 │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  workspace.rs  (job_<id> directory guard)        │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | `Job`, `JobStatus`, `JobCommand`, `Principal`            |
//! | `db`          | SQLite access via `DbHandle` (`Arc<Mutex<_>>` + blocking pool) |
//! | `events`      | `JobEvent` enum, broadcast helper, `/ws` stream          |
//! | `code_source` | Template and AI generators for configuration source     |
//!
//! ## Typical Request Flow (execute)
//!
//! 1. `POST /api/jobs/{id}/execute` → `api::execute_job()`
//! 2. `JobService::execute` takes the job's lock, flips it to `RUNNING`,
//!    registers a cancellation token and releases the lock.
//! 3. The attempt waits for a worker slot, then `ExecutionEngine::run`
//!    creates `<workspace_root>/job_<id>`, writes the config file and runs
//!    `init` followed by the requested command.
//! 4. The workspace is removed, the job's lock is taken again and the
//!    terminal status is written. A cancellation raised before that point
//!    turns the outcome into `CANCELLED`.
//! 5. Every transition is broadcast as a `JobEvent` to `/ws` subscribers.

pub mod api;
pub mod code_source;
pub mod db;
pub mod engine;
pub mod events;
pub mod models;
pub mod server;
pub mod service;
pub mod workspace;
