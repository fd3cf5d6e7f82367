//! Path-pattern call router.
//!
//! A [`Router`] holds an ordered list of [`RouteRule`]s. For each call it
//! considers only the rules registered for the call's operation, takes the
//! first one whose test pattern matches the routed path, extracts named
//! fields with the rule's search pattern and hands everything to the rule's
//! handler. Calls that match nothing go to the fallback handler untouched.
//!
//! Routers nest: a router built with depth `D` ignores the first `D`
//! characters of the path, so a sub-router mounted under `/Network` sees
//! `/Network/abc` as `/abc`.

use crate::handlers::OpHandler;
use crate::ops::{FsCall, FsResult, OpName, OpSet};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Fields a rule's search pattern extracted from a path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMatch {
    /// Id of the rule that matched.
    pub rule: &'static str,
    /// The whole text matched by the search pattern.
    pub matched: String,
    /// Named capture groups that participated in the match.
    pub fields: HashMap<String, String>,
}

impl RouteMatch {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Handler bound to a rule.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// `call` carries the depth-adjusted path.
    async fn handle(&self, route: RouteMatch, call: FsCall) -> FsResult;
}

/// One entry of the interceptor chain.
pub struct RouteRule {
    id: &'static str,
    test: Regex,
    search: Regex,
    ops: OpSet,
    handler: Arc<dyn RouteHandler>,
}

impl RouteRule {
    pub fn new(
        id: &'static str,
        test: &str,
        search: &str,
        ops: OpSet,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id,
            test: Regex::new(test)?,
            search: Regex::new(search)?,
            ops,
            handler,
        })
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn applies_to(&self, op: OpName) -> bool {
        self.ops.contains(op)
    }

    pub fn matches(&self, path: &str) -> bool {
        self.test.is_match(path)
    }

    fn capture(&self, path: &str) -> RouteMatch {
        let mut route = RouteMatch {
            rule: self.id,
            ..RouteMatch::default()
        };
        if let Some(caps) = self.search.captures(path) {
            if let Some(m) = caps.get(0) {
                route.matched = m.as_str().to_string();
            }
            for name in self.search.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    route.fields.insert(name.to_string(), m.as_str().to_string());
                }
            }
        }
        route
    }
}

impl fmt::Debug for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRule")
            .field("id", &self.id)
            .field("test", &self.test.as_str())
            .field("ops", &self.ops)
            .finish_non_exhaustive()
    }
}

/// Ordered, first-match-wins interceptor chain.
pub struct Router {
    rules: Vec<RouteRule>,
    /// Indices into `rules` per operation, in declaration order.
    active: HashMap<OpName, Vec<usize>>,
    depth: usize,
    fallback: Arc<dyn OpHandler>,
}

impl Router {
    pub fn new(rules: Vec<RouteRule>, depth: usize, fallback: Arc<dyn OpHandler>) -> Self {
        let active = OpName::ALL
            .iter()
            .map(|&op| {
                let idx = rules
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.applies_to(op))
                    .map(|(i, _)| i)
                    .collect();
                (op, idx)
            })
            .collect();
        Self {
            rules,
            active,
            depth,
            fallback,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Rules considered for `op`, in order.
    pub fn rules_for(&self, op: OpName) -> impl Iterator<Item = &RouteRule> {
        self.active
            .get(&op)
            .into_iter()
            .flatten()
            .map(|&i| &self.rules[i])
    }

    /// Picks the rule for `call`, if any, and the depth-adjusted path.
    pub fn classify(&self, call: &FsCall) -> Option<(&RouteRule, String)> {
        let path = strip_depth(call.routed_path(), self.depth);
        self.rules_for(call.op())
            .find(|rule| rule.matches(path))
            .map(|rule| (rule, path.to_string()))
    }
}

#[async_trait]
impl OpHandler for Router {
    async fn call(&self, call: FsCall) -> FsResult {
        let Some((rule, path)) = self.classify(&call) else {
            tracing::trace!(op = %call.op(), path = call.routed_path(), depth = self.depth, "no route, falling through");
            return self.fallback.call(call).await;
        };
        let route = rule.capture(&path);
        tracing::trace!(op = %call.op(), rule = rule.id, path = %path, "routed");
        let handler = Arc::clone(&rule.handler);
        handler.handle(route, call.with_routed_path(path)).await
    }
}

/// Drops the first `depth` characters of `path`.
fn strip_depth(path: &str, depth: usize) -> &str {
    if depth == 0 {
        return path;
    }
    match path.char_indices().nth(depth) {
        Some((idx, _)) => &path[idx..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Reply;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// Records what it saw and answers with a marker.
    #[derive(Default)]
    struct Probe {
        seen: Mutex<Vec<(String, RouteMatch)>>,
    }

    #[async_trait]
    impl RouteHandler for Probe {
        async fn handle(&self, route: RouteMatch, call: FsCall) -> FsResult {
            let marker = route.rule.to_string();
            self.seen.lock().push((call.routed_path().to_string(), route));
            Ok(Reply::Link(marker))
        }
    }

    #[derive(Default)]
    struct Fallback {
        seen: Mutex<Vec<FsCall>>,
    }

    #[async_trait]
    impl OpHandler for Fallback {
        async fn call(&self, call: FsCall) -> FsResult {
            self.seen.lock().push(call);
            Ok(Reply::Link("fallback".into()))
        }
    }

    fn getattr(path: &str) -> FsCall {
        FsCall::Getattr { path: path.into() }
    }

    fn link_of(res: FsResult) -> String {
        match res {
            Ok(Reply::Link(s)) => s,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let probe = Arc::new(Probe::default());
        let rules = vec![
            RouteRule::new("a", "^/x", "", OpSet::All, probe.clone()).unwrap(),
            RouteRule::new("b", "^/x/y", "", OpSet::All, probe.clone()).unwrap(),
        ];
        let router = Router::new(rules, 0, Arc::new(Fallback::default()));
        assert_eq!(link_of(router.call(getattr("/x/y")).await), "a");
    }

    #[tokio::test]
    async fn test_rules_only_apply_to_their_ops() {
        let probe = Arc::new(Probe::default());
        let fallback = Arc::new(Fallback::default());
        let rules = vec![
            RouteRule::new("list", "^/$", "", OpSet::only(&[OpName::Readdir]), probe.clone())
                .unwrap(),
        ];
        let router = Router::new(rules, 0, fallback.clone());

        assert_eq!(
            link_of(router.call(FsCall::Readdir { path: "/".into() }).await),
            "list"
        );
        assert_eq!(link_of(router.call(getattr("/")).await), "fallback");
        assert_eq!(fallback.seen.lock().as_slice(), &[getattr("/")]);
    }

    #[tokio::test]
    async fn test_nested_depth_strips_prefix_and_fallback_is_unmodified() {
        let probe = Arc::new(Probe::default());
        let fallback = Arc::new(Fallback::default());
        let rules = vec![
            RouteRule::new(
                "by-key",
                "^/.+",
                r"^(/(?P<key>\w+)(\+(?P<version>\d+))?/?)?",
                OpSet::All,
                probe.clone(),
            )
            .unwrap(),
        ];
        let router = Router::new(rules, "/Network".len(), fallback.clone());

        assert_eq!(link_of(router.call(getattr("/Network/abc+7/f")).await), "by-key");
        let (path, route) = probe.seen.lock()[0].clone();
        assert_eq!(path, "/abc+7/f");
        assert_eq!(route.field("key"), Some("abc"));
        assert_eq!(route.field("version"), Some("7"));
        assert_eq!(route.matched, "/abc+7/");

        // "/Network" alone strips to "", which the rule does not match.
        link_of(router.call(getattr("/Network")).await);
        assert_eq!(fallback.seen.lock().as_slice(), &[getattr("/Network")]);
    }

    #[tokio::test]
    async fn test_symlink_routes_on_second_argument() {
        let probe = Arc::new(Probe::default());
        let rules = vec![RouteRule::new("net", "^/Network/", "", OpSet::All, probe.clone()).unwrap()];
        let router = Router::new(rules, 0, Arc::new(Fallback::default()));
        let res = router
            .call(FsCall::Symlink {
                target: "/elsewhere".into(),
                path: "/Network/k/link".into(),
            })
            .await;
        assert_eq!(link_of(res), "net");
        let res = router
            .call(FsCall::Symlink {
                target: "/Network/k".into(),
                path: "/link".into(),
            })
            .await;
        assert_eq!(link_of(res), "fallback");
    }

    #[test]
    fn test_strip_depth() {
        assert_eq!(strip_depth("/Network/x", 8), "/x");
        assert_eq!(strip_depth("/Net", 8), "");
        assert_eq!(strip_depth("/é/x", 2), "/x");
    }

    proptest! {
        #[test]
        fn prop_unmatched_calls_fall_through_verbatim(path in "/[a-z]{0,12}") {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let fallback = Arc::new(Fallback::default());
            let rules = vec![
                RouteRule::new("never", "^/Network", "", OpSet::All, Arc::new(Probe::default()))
                    .unwrap(),
            ];
            let router = Router::new(rules, 0, fallback.clone());
            let call = FsCall::Readlink { path: path.clone() };
            let res = rt.block_on(router.call(call.clone()));
            prop_assert_eq!(link_of(res), "fallback");
            let seen = fallback.seen.lock();
            prop_assert_eq!(seen.as_slice(), &[call]);
        }
    }
}
