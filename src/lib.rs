//! kwpm: Kubernetes WordPress manager
//!
//! Builds the desired-state document of a WordPress site (a PHP-FPM
//! application container paired with an nginx sidecar on a shared volume),
//! checks it offline and applies it to a cluster.
//!
//! ## Site file
//!
//! ```yaml
//! name: blog
//! wordpressImage: wordpress:php8.2-fpm
//! databaseHost: mariadb.kwpm-mariadb.svc.cluster.local
//! nginxConfigMode: 288 # 0o440
//! ```

pub mod client;
pub mod drift;
pub mod error;
pub mod manifest;
pub mod preflight;
pub mod site;
pub mod validation;

pub use client::{ApplyOutcome, DbCredentials, KwpmClient};
pub use error::{KwpmError, Result};
pub use manifest::Manifest;
pub use site::SiteSpec;
