//! IBB protocol elements and their XML form

mod codec;
mod payload;

pub use codec::{element_name, ElementName};
pub use payload::{Close, Data, IbbPayload, Open};
