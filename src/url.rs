//! Address value type shared by producers, consumers and the registry locator.
//!
//! Format: `protocol://[user[:password]@]host[:port][,host:port...]/path?k=v&...`.
//! Extra comma separated hosts in the authority are folded into the `backup`
//! parameter so the first host always stays the primary address.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use url::form_urlencoded;

use crate::constants::ANY_VALUE;
use crate::constants::BACKUP_KEY;
use crate::constants::CATEGORY_KEY;
use crate::constants::CLASSIFIER_KEY;
use crate::constants::COMMA_SEPARATOR;
use crate::constants::DEFAULT_CATEGORY;
use crate::constants::EMPTY_PROTOCOL;
use crate::constants::ENABLED_KEY;
use crate::constants::GROUP_KEY;
use crate::constants::INTERFACE_KEY;
use crate::constants::REMOVE_VALUE_PREFIX;
use crate::constants::VERSION_KEY;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Url {
    protocol: String,
    username: Option<String>,
    password: Option<String>,
    host: String,
    port: u16,
    path: String,
    parameters: BTreeMap<String, String>,
}

impl Url {
    pub fn new(
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: path.trim_start_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// `host:port`, or just `host` when no port is set
    pub fn address(&self) -> String {
        if self.port == 0 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Primary address followed by every `backup` address
    pub fn backup_addresses(&self) -> Vec<String> {
        let mut addresses = vec![self.address()];
        if let Some(backup) = self.parameter(BACKUP_KEY) {
            addresses.extend(split_list(backup).map(str::to_string));
        }
        addresses
    }

    pub fn parameter(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn parameter_or<'a>(
        &'a self,
        key: &str,
        default: &'a str,
    ) -> &'a str {
        self.parameter(key).unwrap_or(default)
    }

    pub fn bool_parameter(
        &self,
        key: &str,
        default: bool,
    ) -> bool {
        self.parameter(key)
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(default)
    }

    pub fn with_protocol(
        mut self,
        protocol: impl Into<String>,
    ) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_path(
        mut self,
        path: impl Into<String>,
    ) -> Self {
        self.path = path.into().trim_start_matches('/').to_string();
        self
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn without_parameter(
        mut self,
        key: &str,
    ) -> Self {
        self.parameters.remove(key);
        self
    }

    /// Service identity: the `interface` parameter, falling back to the path
    pub fn service_interface(&self) -> &str {
        self.parameter(INTERFACE_KEY).unwrap_or(&self.path)
    }

    pub fn category(&self) -> &str {
        self.parameter_or(CATEGORY_KEY, DEFAULT_CATEGORY)
    }

    /// Categories named by the `category` parameter (defaults to providers)
    pub fn categories(&self) -> Vec<&str> {
        match self.parameter(CATEGORY_KEY) {
            Some(value) => {
                let categories: Vec<&str> = split_list(value).collect();
                if categories.is_empty() {
                    vec![DEFAULT_CATEGORY]
                } else {
                    categories
                }
            }
            None => vec![DEFAULT_CATEGORY],
        }
    }

    /// Placeholder delivered to subscribers when `category` currently has no match
    pub fn empty_placeholder(
        &self,
        category: &str,
    ) -> Url {
        self.clone()
            .with_protocol(EMPTY_PROTOCOL)
            .with_parameter(CATEGORY_KEY, category)
    }

    pub fn is_empty_placeholder(&self) -> bool {
        self.protocol == EMPTY_PROTOCOL
    }

    pub fn to_full_string(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(&self.protocol);
        out.push_str("://");
        if let Some(username) = &self.username {
            out.push_str(username);
            if let Some(password) = &self.password {
                out.push(':');
                out.push_str(password);
            }
            out.push('@');
        }
        out.push_str(&self.address());
        out.push('/');
        out.push_str(&self.path);
        if !self.parameters.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.parameters.iter())
                .finish();
            out.push('?');
            out.push_str(&query);
        }
        out
    }
}

impl fmt::Display for Url {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.to_full_string())
    }
}

impl FromStr for Url {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUrl {
            url: input.to_string(),
            reason: reason.to_string(),
        };

        let input = input.trim();
        let (protocol, rest) = input.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if protocol.is_empty() {
            return Err(invalid("empty scheme"));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let (user_info, hosts) = match authority.rsplit_once('@') {
            Some((user_info, hosts)) => (Some(user_info), hosts),
            None => (None, authority),
        };
        let (username, password) = match user_info {
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(info.to_string()), None),
            },
            None => (None, None),
        };

        let mut hosts = hosts.split(COMMA_SEPARATOR).filter(|h| !h.is_empty());
        let primary = hosts.next().unwrap_or_default();
        let extra: Vec<&str> = hosts.collect();

        let (host, port) = match primary.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
                (host.to_string(), port)
            }
            None => (primary.to_string(), 0),
        };

        let mut parameters: BTreeMap<String, String> = query
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        if !extra.is_empty() {
            let mut backup: Vec<String> = extra.iter().map(|h| h.to_string()).collect();
            if let Some(existing) = parameters.get(BACKUP_KEY) {
                backup.extend(split_list(existing).map(str::to_string));
            }
            parameters.insert(BACKUP_KEY.to_string(), backup.join(","));
        }

        Ok(Url {
            protocol: protocol.to_string(),
            username,
            password,
            host,
            port,
            path: path.to_string(),
            parameters,
        })
    }
}

/// Encode a value so it can be used as a single key path segment
pub fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Reverse of [`encode`]
pub fn decode(value: &str) -> String {
    // An encoded segment never contains a raw '&' or '=', so it parses as one bare key.
    form_urlencoded::parse(value.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(COMMA_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Whether `category` is selected by a subscriber's category list
pub fn is_match_category(
    category: &str,
    categories: &str,
) -> bool {
    if categories.is_empty() {
        return category == DEFAULT_CATEGORY;
    }
    let wanted: Vec<&str> = split_list(categories).collect();
    if wanted.contains(&ANY_VALUE) {
        return true;
    }
    let removed = format!("{REMOVE_VALUE_PREFIX}{category}");
    if wanted.iter().any(|c| *c == removed) {
        return false;
    }
    wanted.contains(&category)
}

/// Whether a registered address satisfies a subscriber's pattern.
///
/// Interface, category, enabled flag, group, version and classifier are
/// compared; `*` on the consumer side matches anything.
pub fn is_match(
    consumer: &Url,
    provider: &Url,
) -> bool {
    let consumer_interface = consumer.service_interface();
    let provider_interface = provider.service_interface();
    if !(consumer_interface == ANY_VALUE
        || provider_interface == ANY_VALUE
        || consumer_interface == provider_interface)
    {
        return false;
    }

    if !is_match_category(
        provider.category(),
        consumer.parameter_or(CATEGORY_KEY, DEFAULT_CATEGORY),
    ) {
        return false;
    }

    if !provider.bool_parameter(ENABLED_KEY, true) && consumer.parameter(ENABLED_KEY) != Some(ANY_VALUE) {
        return false;
    }

    let consumer_group = consumer.parameter(GROUP_KEY);
    let provider_group = provider.parameter(GROUP_KEY);
    let group_matches = consumer_group == Some(ANY_VALUE)
        || consumer_group == provider_group
        || match (consumer_group, provider_group) {
            (Some(groups), Some(group)) => split_list(groups).any(|g| g == group),
            _ => false,
        };

    let consumer_version = consumer.parameter(VERSION_KEY);
    let version_matches = consumer_version == Some(ANY_VALUE) || consumer_version == provider.parameter(VERSION_KEY);

    let consumer_classifier = consumer.parameter_or(CLASSIFIER_KEY, ANY_VALUE);
    let classifier_matches =
        consumer_classifier == ANY_VALUE || consumer_classifier == provider.parameter_or(CLASSIFIER_KEY, ANY_VALUE);

    group_matches && version_matches && classifier_matches
}
