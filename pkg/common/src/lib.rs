#[macro_use]
extern crate async_trait;
#[macro_use]
pub extern crate failure;
pub extern crate async_std;

pub mod args;
pub mod bundle;
pub mod cancellation;
pub mod errors;
pub mod task;

pub use async_trait::*;
pub use cancellation::CancellationToken;
pub use failure::Fail;
