//! PostgreSQL implementation of the job queue storage contracts.
//!
//! This crate provides the production [`jobq_core::Backend`] — a
//! partitioned, multi-policy schema with `FOR UPDATE SKIP LOCKED` claiming,
//! partial-unique-index policy enforcement, and advisory-lock-guarded
//! schema migrations.
//!
//! # Database schema
//!
//! Each queue is its own partition of a `job` table, keyed by `name`:
//!
//! ```sql
//! CREATE TABLE job (
//!     name TEXT NOT NULL REFERENCES queue (name),
//!     id UUID NOT NULL DEFAULT gen_random_uuid(),
//!     state TEXT NOT NULL DEFAULT 'created'
//!         CHECK (state IN ('created', 'retry', 'active', 'completed', 'cancelled', 'failed')),
//!     -- ...
//!     PRIMARY KEY (name, id)
//! ) PARTITION BY LIST (name);
//!
//! CREATE TABLE job_email_send PARTITION OF job FOR VALUES IN ('email-send');
//! CREATE UNIQUE INDEX job_email_send_singleton_idx ON job_email_send (name)
//!     WHERE state = 'active';
//! ```
//!
//! See [`migrations::chain`] for the full installed DDL.
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobq_postgres::PgBackend;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let backend = PgBackend::new(pool, "job_queue");
//! backend.migrate().await?;
//!
//! let manager = jobq_core::Manager::new(Arc::new(backend), jobq_core::ManagerConfig::default());
//! ```

mod migrations;
mod plan;
mod row;
mod store;

pub use migrations::{chain, Migration, MigrationStore};
pub use store::PgBackend;
