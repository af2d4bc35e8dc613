//! Floor Entry Service
//!
//! Data-entry backend for the factory floor. Operators submit production,
//! packing and downtime records over HTTP; each record is placed in a shift
//! bucket by its own timestamp, persisted as a JSON document in PostgreSQL,
//! and mirrored as a row in a per-shift CSV export.
//!
//! ## Shifts
//!
//! | shift  | time of day            |
//! |--------|------------------------|
//! | First  | 07:00:00 – 15:25:00    |
//! | Second | 15:30:00 – 23:59:59    |
//! | Off    | everything else        |
//!
//! ## Architecture
//!
//! ```text
//!  POST /api/{production,packing,downtime}
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌─────────────────────────┐
//! │ Entry        │──▶│ Shift        │──▶│ Document     │──▶│ Export Appender         │
//! │ validation   │   │ resolver     │   │ store        │   │ {date}_{shift}_{kind}   │
//! └──────────────┘   └──────────────┘   └──────────────┘   │ .csv (one lock per file)│
//!        │                                     │           └─────────────────────────┘
//!        ▼                                     ▼
//!   422 + field errors                  PostgreSQL `documents`
//! ```

pub mod api;
pub mod config;
pub mod document_store;
pub mod entries;
pub mod export;
pub mod shift;

pub use api::{create_router, start_api_server, ApiError, AppState, SubmitResponse};
pub use config::Config;
pub use document_store::{DetachedStore, DocumentStore, PgDocumentStore, StoreError};
pub use entries::{
    DowntimeEntry, Entry, FieldError, OperatorType, PackingEntry, ProductionEntry, RecordKind,
    SubmittedAt, TestType, ValidationErrors,
};
pub use export::{ExportAppender, ExportError};
pub use shift::{resolve, Shift, ShiftInfo};
