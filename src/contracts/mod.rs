//! Contract intake: bilingual payloads in, relational rows out.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, TraceLayer, CORS)      │
//! │          │ <─────── │    └─ api.rs  (handlers, envelope, ApiError)     │
//! └──────────┘          │         │                                        │
//!                       │         │ DbHandle::call (spawn_blocking)        │
//!                       │         v                                        │
//!                       │  store.rs  (validate, create/update/delete,      │
//!                       │             import, read path)                   │
//!                       │         │                                        │
//!                       │         ├─ normalize.rs  payload → records       │
//!                       │         │     └─ aliases.rs / coerce.rs          │
//!                       │         └─ resolve.rs    product types, sales    │
//!                       │         v                                        │
//!                       │  db.rs  (ContractDb, schema, reference data)     │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Flow (create)
//!
//! 1. `POST /api/contracts` hands the raw JSON to `ContractDb::create_contract`.
//! 2. `NormalizedContract::from_value` probes every alias table, collects
//!    terms and process checkpoints, and sorts unknown keys into extra-info
//!    bags. It never fails.
//! 3. `store::validate` enforces a contract number and 1..=10 line items.
//! 4. Inside one transaction the sales id and product-type references are
//!    resolved, then the contract and its products are inserted.
//!
//! Updates diff products by numeric id. Any product that would disappear
//! while production records reference it aborts the whole transaction.

pub mod aliases;
pub mod api;
pub mod coerce;
pub mod db;
pub mod models;
pub mod normalize;
pub mod resolve;
pub mod server;
pub mod store;
