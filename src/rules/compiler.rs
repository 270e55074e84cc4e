//! Access-rule compilation and lookup.
//!
//! Raw `METHOD~path` lines are folded into a [`RuleTable`]: for every method
//! a strictly sorted, deduplicated list of literal paths. The table is built
//! once at startup and only ever read afterwards, so it can be shared between
//! connection tasks behind an `Arc` without any locking.

use std::collections::HashMap;

/// Separator between the method and the path in a rule line.
pub const RULE_DELIMITER: char = '~';

/// A single allowlist entry: `method` may be used on `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub method: String,
    pub path: String,
}

impl AccessRule {
    /// Parses a `METHOD~path` line.
    ///
    /// Returns `None` unless the line splits into exactly two non-empty
    /// fields. The method token is kept verbatim; it is not checked against
    /// the methods the proxy actually relays.
    ///
    /// ```
    /// # use veil::rules::AccessRule;
    /// let rule = AccessRule::parse("GET~/status").unwrap();
    /// assert_eq!(rule.method, "GET");
    /// assert_eq!(rule.path, "/status");
    /// assert!(AccessRule::parse("GET~/a~extra").is_none());
    /// ```
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split(RULE_DELIMITER);
        let method = fields.next()?;
        let path = fields.next()?;

        if fields.next().is_some() || method.is_empty() || path.is_empty() {
            return None;
        }

        Some(Self {
            method: method.to_string(),
            path: path.to_string(),
        })
    }
}

/// How a lookup miss is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RoutingMode {
    /// Rules keyed by method; any miss is unauthorized.
    #[default]
    Method,
    /// Rules keyed by path; a path nobody registered is reported as not found.
    Path,
}

/// Outcome of looking a request up in the [`RuleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// Only produced in [`RoutingMode::Path`].
    Unrouted,
}

/// Immutable allowlist compiled from access rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    by_method: HashMap<String, Vec<String>>,
    /// Every path mentioned by any rule, sorted and unique.
    paths: Vec<String>,
}

impl RuleTable {
    /// Compiles raw rule lines into a table.
    ///
    /// Malformed lines are skipped, never reported. An empty input gives an
    /// empty table, which denies everything.
    pub fn compile<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut by_method: HashMap<String, Vec<String>> = HashMap::new();
        let mut paths = Vec::new();

        for rule in lines
            .into_iter()
            .filter_map(|line| AccessRule::parse(line.as_ref()))
        {
            paths.push(rule.path.clone());
            by_method.entry(rule.method).or_default().push(rule.path);
        }

        for list in by_method.values_mut() {
            list.sort_unstable();
            list.dedup();
        }
        paths.sort_unstable();
        paths.dedup();

        Self { by_method, paths }
    }

    /// Returns `true` iff `path` is listed verbatim under `method`.
    ///
    /// Unknown methods are denied. Matching is exact and byte-for-byte; there
    /// is no prefix matching and no slash normalization.
    pub fn authorize(&self, method: &str, path: &str) -> bool {
        self.by_method
            .get(method)
            .is_some_and(|list| list.binary_search_by(|p| p.as_str().cmp(path)).is_ok())
    }

    /// Looks a request up according to `mode`.
    pub fn decide(&self, mode: RoutingMode, method: &str, path: &str) -> Decision {
        if self.authorize(method, path) {
            return Decision::Allow;
        }

        match mode {
            RoutingMode::Method => Decision::Deny,
            RoutingMode::Path if self.has_path(path) => Decision::Deny,
            RoutingMode::Path => Decision::Unrouted,
        }
    }

    /// Whether any method is allowed on `path`.
    pub fn has_path(&self, path: &str) -> bool {
        self.paths
            .binary_search_by(|p| p.as_str().cmp(path))
            .is_ok()
    }

    /// Paths allowed under `method`, in lookup order.
    pub fn paths_for(&self, method: &str) -> &[String] {
        self.by_method
            .get(method)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Methods that have at least one rule, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.by_method.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Total number of distinct (method, path) pairs.
    pub fn len(&self) -> usize {
        self.by_method.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_method.is_empty()
    }
}
