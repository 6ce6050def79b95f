pub mod consent;
pub mod error;
pub mod policy;
pub mod remote;
pub mod storage;
pub mod utils;

pub use crate::consent::instance::{ConsentInstance, ConsentInstanceConfig, UpdateRequest};
pub use crate::consent::record::{
    ConsentMetadata, ConsentRecord, ConsentStringType, PurposeValue,
};
pub use crate::consent::state_manager::{ConsentChangeHandler, ConsentStateManager};
pub use crate::consent::ConsentState;
pub use crate::error::{ConsentError, ConsentResult};
pub use crate::policy::instance::PolicyInstance;
pub use crate::policy::manager::{PolicyChangeCallback, PolicyManager};
pub use crate::policy::{PolicyConfig, PolicyStatus, PREDEFINED_POLICIES};
pub use crate::remote::{ConsentRemote, HttpConsentRemote, UpdateHrefRequest};
pub use crate::storage::{SharedStorage, Storage};
