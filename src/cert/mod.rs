//! Directory certificates: facets, index, cache and lookups.

pub mod cache;
pub mod facets;
pub mod index;
pub mod store;

pub use cache::{CertificateCache, ResolvedCertificate};
pub use facets::{CertFacets, DecodedCertificate};
pub use index::{CertIndexSnapshot, CertKey, CertLocator, CertificateIndex};
pub use store::CertificateStore;
