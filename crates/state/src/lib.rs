#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod errors;
pub use errors::{StateError, StateResult};

mod update;
pub use update::BlockUpdate;

mod live;
pub use live::LiveState;

mod archive;
pub use archive::{Archive, SealedBlock};

pub mod verify;
