mod auth;
mod catalog;
mod error;
mod fetch;

pub use auth::{StaticToken, TokenSource};
pub use catalog::{
    AlbumEntry, ByteStream, Fingerprint, MediaEntry, Page, RemoteCatalog, fingerprint_changed,
};
pub use error::{CatalogError, ErrorClass, classify_locator_status};
pub use fetch::LocatorFetcher;
