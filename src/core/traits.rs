//! Core traits for hubsync.
//!
//! These traits define what a type needs to be stored in a container.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::constants::DEFAULT_KEY_FIELD;
use super::key::KeyKind;

/// An entity stored in a hub container.
///
/// The entity is encoded to a JSON object; its key lives in the field named
/// [`Entity::KEY_FIELD`] and must have the kind [`Entity::KEY_KIND`].
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Article {
///     id: String,
///     name: String,
///     producer: Option<String>,
/// }
///
/// impl Entity for Article {
///     const CONTAINER: &'static str = "articles";
///     const KEY_KIND: KeyKind = KeyKind::String;
/// }
///
/// let articles = client.container::<String, Article>()?;
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the container holding this entity type.
    const CONTAINER: &'static str;

    /// Name of the primary key field.
    const KEY_FIELD: &'static str = DEFAULT_KEY_FIELD;

    /// Kind of the primary key field.
    const KEY_KIND: KeyKind;
}
