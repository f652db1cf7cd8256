//! Key layout: `/<root>/<interface>/<category>/<encoded address>`.

use crate::constants::ALL_CATEGORIES;
use crate::constants::ANY_VALUE;
use crate::constants::PATH_SEPARATOR;
use crate::constants::REMOVE_VALUE_PREFIX;
use crate::url::encode;
use crate::Url;

/// `/<root>/<interface>`, or the root itself for a wildcard interface
pub(crate) fn service_path(
    root: &str,
    url: &Url,
) -> String {
    let interface = url.service_interface();
    if interface == ANY_VALUE {
        return root.to_string();
    }
    format!("{root}{PATH_SEPARATOR}{}", encode(interface))
}

pub(crate) fn category_path(
    root: &str,
    url: &Url,
    category: &str,
) -> String {
    format!("{}{PATH_SEPARATOR}{category}", service_path(root, url))
}

/// Categories a subscriber listens on; `*` selects all of them
pub(crate) fn subscribed_categories(url: &Url) -> Vec<&str> {
    let categories = url.categories();
    if categories.contains(&ANY_VALUE) {
        return ALL_CATEGORIES.to_vec();
    }
    categories
        .into_iter()
        .filter(|c| !c.starts_with(REMOVE_VALUE_PREFIX))
        .collect()
}

/// `(category, path)` of every category directory a subscriber listens on
pub(crate) fn category_paths(
    root: &str,
    url: &Url,
) -> Vec<(String, String)> {
    subscribed_categories(url)
        .into_iter()
        .map(|category| (category.to_string(), category_path(root, url, category)))
        .collect()
}

/// Ephemeral key of a registered address
pub(crate) fn url_path(
    root: &str,
    url: &Url,
) -> String {
    format!(
        "{}{PATH_SEPARATOR}{}",
        category_path(root, url, url.category()),
        encode(&url.to_full_string())
    )
}
