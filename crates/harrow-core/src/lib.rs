pub mod error;
pub mod field;
pub mod harvest;
pub mod hosts;
pub mod pool;
pub mod registry;
pub mod response;
pub mod scrape;
pub mod source;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{AppError, ErrorClass};
pub use field::{AttemptConfig, FieldConfig, FieldMap, FieldSet, FieldValue};
pub use harvest::{Harvester, UrlReport};
pub use hosts::{Host, HostRegistry, HostsConfig};
pub use pool::{Pool, PoolConfig, TaskOutput};
pub use registry::{SessionCache, SessionSlot};
pub use response::{BackendKind, RawResponse, Response};
pub use scrape::{CostTable, Scraper, ScraperConfig};
pub use source::{ENDPOINT_BONUS, Source, SourceRouter};
pub use traits::{Backend, FetchRequest, Interactive};
