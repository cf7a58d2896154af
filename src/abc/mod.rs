//! The ABC dialect: line-oriented folk notation with header fields.
//!
//! An ABC source starts with an optional `%abc-<version>` line, carries
//! `X:`/`T:`/`K:`/`M:`/`L:`/`Q:` header fields, and holds one or more
//! tunes whose bodies end at a blank line. See [`AbcPlayer`] for the
//! playable surface and [`keys`] for key signature resolution.

pub mod header;
pub mod keys;
pub mod lotro;
pub mod player;
pub mod tokenizer;

pub use header::{FieldInfo, Tune, TuneHeader};
pub use player::{AbcConfig, AbcPlayer, AccidentalPropagation};
pub use tokenizer::tokenize;
