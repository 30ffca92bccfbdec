//! Two-tier request router.
//!
//! Tier one is an exact-match table keyed by `METHOD:path` with surrounding
//! slashes and whitespace trimmed. It is consulted first and exists for paths
//! the pattern matcher cannot express. Tier two is one radix tree per HTTP
//! method (via [`matchit`]), O(path-length) lookup, supporting named segments
//! and catch-all remainders.
//!
//! Both tiers are filled during registration and only read afterwards, so
//! lookups need no locking.

use std::collections::HashMap;

use http::Method;
use matchit::Router as MatchitRouter;

/// The application router, generic over what a route resolves to.
pub(crate) struct Router<T> {
    trees: HashMap<Method, MatchitRouter<T>>,
    exact: HashMap<String, T>,
    routes: Vec<(Method, String)>,
}

impl<T: Clone> Router<T> {
    pub(crate) fn new() -> Self {
        Self { trees: HashMap::new(), exact: HashMap::new(), routes: Vec::new() }
    }

    /// Registers `value` for a method + path pattern.
    ///
    /// Patterns accept `:name` or `{name}` segments and a trailing `*rest` or
    /// `{*rest}` catch-all.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is malformed or conflicts with an existing route.
    pub(crate) fn insert(&mut self, method: Method, path: &str, value: T) {
        let pattern = to_matchit(path);
        self.trees
            .entry(method.clone())
            .or_insert_with(MatchitRouter::new)
            .insert(pattern, value)
            .unwrap_or_else(|e| panic!("invalid route `{method} {path}`: {e}"));
        self.routes.push((method, path.to_owned()));
    }

    /// Registers `value` in the exact-match table.
    ///
    /// # Panics
    ///
    /// Panics if the same method and normalized path is already registered.
    pub(crate) fn insert_exact(&mut self, method: Method, path: &str, value: T) {
        let key = exact_key(&method, path);
        if self.exact.insert(key, value).is_some() {
            panic!("duplicate exact route `{method} {path}`");
        }
        self.routes.push((method, path.to_owned()));
    }

    /// Resolves a request to its route value and extracted path parameters.
    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Option<(T, HashMap<String, String>)> {
        if let Some(value) = self.exact.get(&exact_key(method, path)) {
            return Some((value.clone(), HashMap::new()));
        }

        let matched = match_tree(self.trees.get(method)?, path)?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((matched.value.clone(), params))
    }

    /// Methods that have a route for `path`, sorted by name. Empty when no
    /// method does.
    pub(crate) fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let normalized = normalize_exact(path);
        let exact = self.exact.keys().filter_map(|key| {
            let (method, rest) = key.split_once(':')?;
            if rest != normalized {
                return None;
            }
            Method::from_bytes(method.as_bytes()).ok()
        });
        let patterns = self.trees.iter()
            .filter(|(_, tree)| match_tree(tree, path).is_some())
            .map(|(method, _)| method.clone());

        let mut methods: Vec<Method> = exact.chain(patterns).collect();
        methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        methods.dedup();
        methods
    }

    /// Every registered `(method, path)` pair, in registration order.
    pub(crate) fn routes(&self) -> &[(Method, String)] {
        &self.routes
    }
}

/// Matches `path`, retrying once without a trailing slash.
fn match_tree<'t, 'p, T>(tree: &'t MatchitRouter<T>, path: &'p str) -> Option<matchit::Match<'t, 'p, &'t T>> {
    match tree.at(path) {
        Ok(matched) => Some(matched),
        Err(_) => {
            let trimmed = path.strip_suffix('/').filter(|p| !p.is_empty())?;
            tree.at(trimmed).ok()
        }
    }
}

fn normalize_exact(path: &str) -> &str {
    path.trim_matches(|c: char| c == '/' || c.is_whitespace())
}

fn exact_key(method: &Method, path: &str) -> String {
    format!("{method}:{}", normalize_exact(path))
}

/// Rewrites `:name` and `*rest` segments into matchit's `{name}` / `{*rest}`.
fn to_matchit(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins a group prefix and a route path into one absolute path.
pub(crate) fn join_path(prefix: &str, path: &str) -> String {
    let path = path.trim();
    let prefix = prefix.trim_end_matches('/');
    match path {
        "" | "/" if prefix.is_empty() => "/".to_owned(),
        "" | "/" => prefix.to_owned(),
        _ if path.starts_with('/') => format!("{prefix}{path}"),
        _ => format!("{prefix}/{path}"),
    }
}
