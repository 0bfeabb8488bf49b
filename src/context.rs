//! Named, hierarchical bags of capability tokens.
//!
//! A context holds at most one token per capability type and may point at a
//! parent through a weak reference, so children never keep their parent
//! alive. Membership is mutated through `&mut self` only, which means it can
//! only change before the context is wrapped in an `Arc` and shared.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use crate::capability::{CapabilityToken, CapabilityType};

#[derive(Debug)]
pub struct CapabilityContext {
    name: String,
    tokens: HashMap<CapabilityType, CapabilityToken>,
    parent: Option<Weak<CapabilityContext>>,
}

impl CapabilityContext {
    pub fn new(name: impl Into<String>, parent: Option<&Arc<CapabilityContext>>) -> Self {
        Self {
            name: name.into(),
            tokens: HashMap::new(),
            parent: parent.map(Arc::downgrade),
        }
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Builder-style helper for assembling a context before it is shared.
    pub fn with_capability(mut self, token: CapabilityToken) -> Self {
        self.add_capability(token);
        self
    }

    /// Insert or replace the token for `token.capability_type()`.
    pub fn add_capability(&mut self, token: CapabilityToken) {
        self.tokens.insert(token.capability_type().clone(), token);
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent context, if one was given and it is still alive.
    pub fn parent(&self) -> Option<Arc<CapabilityContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// True when the nearest token for `capability_type` exists and, if a
    /// resource is given, matches it. The nearest token decides; a
    /// non-matching local token is never overridden by an ancestor.
    pub fn has_capability(
        &self,
        capability_type: &CapabilityType,
        resource: Option<&str>,
        check_parents: bool,
    ) -> bool {
        self.visit_nearest(capability_type, check_parents, |token| match resource {
            Some(resource) => token.matches(Some(resource)),
            None => true,
        })
        .unwrap_or(false)
    }

    pub fn get_capability(
        &self,
        capability_type: &CapabilityType,
        check_parents: bool,
    ) -> Option<CapabilityToken> {
        self.visit_nearest(capability_type, check_parents, CapabilityToken::clone)
    }

    /// Effective capability types, nearest first wins, sorted by name.
    pub fn capability_types(&self, check_parents: bool) -> Vec<CapabilityType> {
        let mut types: BTreeSet<CapabilityType> = self.tokens.keys().cloned().collect();
        if check_parents {
            let mut next = self.parent();
            while let Some(ctx) = next {
                types.extend(ctx.tokens.keys().cloned());
                next = ctx.parent();
            }
        }
        types.into_iter().collect()
    }

    /// Number of tokens held locally.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn local_token(&self, capability_type: &CapabilityType) -> Option<&CapabilityToken> {
        self.tokens.get(capability_type).or_else(|| {
            self.tokens
                .get(&CapabilityType::new(CapabilityType::UNIVERSAL))
        })
    }

    fn visit_nearest<R>(
        &self,
        capability_type: &CapabilityType,
        check_parents: bool,
        f: impl FnOnce(&CapabilityToken) -> R,
    ) -> Option<R> {
        if let Some(token) = self.local_token(capability_type) {
            return Some(f(token));
        }
        if !check_parents {
            return None;
        }
        let mut next = self.parent();
        while let Some(ctx) = next {
            if let Some(token) = ctx.local_token(capability_type) {
                return Some(f(token));
            }
            next = ctx.parent();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(name: &str) -> CapabilityType {
        CapabilityType::new(name)
    }

    #[test]
    fn child_inherits_from_parent_only_when_asked() {
        let parent = CapabilityContext::root("parent")
            .with_capability(CapabilityToken::unconstrained("x"))
            .into_shared();
        let child = CapabilityContext::new("child", Some(&parent));

        assert!(child.has_capability(&cap("x"), None, true));
        assert!(!child.has_capability(&cap("x"), None, false));
    }

    #[test]
    fn most_recent_token_wins_locally() {
        let mut ctx = CapabilityContext::root("ctx");
        ctx.add_capability(CapabilityToken::scoped("file.read", &["/a/*"]).unwrap());
        ctx.add_capability(CapabilityToken::scoped("file.read", &["/b/*"]).unwrap());

        assert_eq!(ctx.len(), 1);
        assert!(ctx.has_capability(&cap("file.read"), Some("/b/1"), true));
        assert!(!ctx.has_capability(&cap("file.read"), Some("/a/1"), true));
    }

    #[test]
    fn nearest_ancestor_decides_resource_match() {
        let parent = CapabilityContext::root("parent")
            .with_capability(CapabilityToken::unconstrained("file.read"))
            .into_shared();
        let child = CapabilityContext::new("child", Some(&parent))
            .with_capability(CapabilityToken::scoped("file.read", &["/data/*"]).unwrap());

        assert!(child.has_capability(&cap("file.read"), Some("/data/a"), true));
        // The parent's broader grant is not merged in.
        assert!(!child.has_capability(&cap("file.read"), Some("/etc/passwd"), true));
    }

    #[test]
    fn dropped_parent_yields_false() {
        let parent = CapabilityContext::root("parent")
            .with_capability(CapabilityToken::unconstrained("x"))
            .into_shared();
        let child = CapabilityContext::new("child", Some(&parent));
        drop(parent);

        assert!(child.parent().is_none());
        assert!(!child.has_capability(&cap("x"), None, true));
        assert!(child.get_capability(&cap("x"), true).is_none());
    }

    #[test]
    fn universal_token_satisfies_any_type() {
        let ctx = CapabilityContext::root("open").with_capability(CapabilityToken::universal());
        assert!(ctx.has_capability(&cap("net.http"), Some("https://x"), false));
        assert!(ctx.has_capability(&cap("crypto.random"), None, false));
    }

    #[test]
    fn capability_types_merge_ancestors() {
        let grand = CapabilityContext::root("g")
            .with_capability(CapabilityToken::unconstrained("a"))
            .into_shared();
        let parent = CapabilityContext::new("p", Some(&grand))
            .with_capability(CapabilityToken::unconstrained("b"))
            .into_shared();
        let child = CapabilityContext::new("c", Some(&parent))
            .with_capability(CapabilityToken::unconstrained("a"));

        assert_eq!(child.capability_types(true), vec![cap("a"), cap("b")]);
        assert_eq!(child.capability_types(false), vec![cap("a")]);
    }
}
