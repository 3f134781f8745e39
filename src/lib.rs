//! `pst-migrate` moves the messages of a PST archive into individually
//! addressable EML objects, skipping messages an earlier run already moved.
//!
//! The [`walk::Walker`] visits the archive tree and feeds batches to the
//! [`dispatch::Dispatcher`], which asks the [`dedup::DedupOracle`] what is
//! new, encodes new messages with [`mail::MailBuilder`] and hands them to a
//! [`sink::DeliverySink`].

pub mod archive;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod mail;
pub mod path;
pub mod progress;
pub mod sink;
pub mod stream;
pub mod walk;

pub use error::{Error, Result};
