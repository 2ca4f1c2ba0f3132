//! Studio: prompt in, generated project fragment out.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ Producer::submit()                     │
//!                       │         v                                        │
//!                       │  producer.rs  (validate, persist + enqueue)      │
//!                       │         │                                        │
//!                       │         │ job_events row (same transaction)      │
//!                       │         v                                        │
//!                       │  queue.rs  (claim / lease / retry)               │
//!                       │         │                                        │
//!                       │         │ Worker::run_until()                    │
//!                       │         v                                        │
//!                       │  consumer.rs  (JobConsumer, Worker)              │
//!                       │         │                                        │
//!                       │         │ CodeAgent::run(prompt)                 │
//!                       │         v                                        │
//!                       │  agent.rs  (Gemini backend, stub, OutputParser)  │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                          |
//! |----------|---------------------------------------------------------|
//! | `models` | `Project`, `Message`, `Fragment`, `JobEvent`, payloads  |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `ws`     | `WsMessage` enum + `broadcast_message()` helper         |
//! | `slug`   | Random two-word project names                           |
//!
//! ## Request Flow
//!
//! 1. `POST /api/projects {value}` → `Producer::submit()` writes the project,
//!    its USER message and a `code-agent/run` event in one transaction.
//! 2. The worker claims the event, builds the prompt and runs a fresh agent.
//! 3. The agent output becomes an AGENT message with a fragment; the write
//!    is keyed by the event id, so a redelivered event appends nothing.
//! 4. Failures go back to the queue; once attempts run out an AGENT ERROR
//!    message is recorded. Every new message is broadcast over `/ws`.

pub mod agent;
pub mod api;
pub mod consumer;
pub mod db;
pub mod models;
pub mod producer;
pub mod queue;
pub mod server;
pub mod slug;
pub mod ws;
