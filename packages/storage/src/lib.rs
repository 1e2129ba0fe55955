pub mod error;
pub mod presign;
pub mod router;
pub mod store;

pub use error::TransferError;
pub use object_store;
pub use object_store::path::Path;
pub use presign::{Operation, PresignedUrl, SignedQuery, UrlSigner};
pub use router::object_routes;
pub use store::{JobplaneStore, ObjectGateway, parse_locator};
