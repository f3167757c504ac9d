//! Authorisation kernel for the knowledge-graph control plane (spec §4.8).
//!
//! Two layers feed every decision: role-permission resolution (a transitive
//! closure over [`kg_core::Role::parent_role`], deny-overrides-allow during
//! the walk) and, when no role permission matches, a resource-grant fallback
//! that includes the implicit `public` group. Scope-filtered permissions
//! delegate predicate evaluation to [`kg_rule_engine`]. OAuth token
//! validation is a narrow [`TokenValidator`] hook; minting tokens is out
//! of scope here.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use kg_core::{PrincipalType, ResourceGrant, Role, RolePermission, ScopeType};
use kg_rule_engine::{Condition, Facts};
use serde::{Deserialize, Serialize};

/// The built-in role chain seeded at migration time, narrowest to broadest
/// (spec §4.8): `read_only -> contributor -> curator -> admin ->
/// platform_admin`.
pub const BUILTIN_ROLE_CHAIN: [&str; 5] =
    ["read_only", "contributor", "curator", "admin", "platform_admin"];

/// Build the built-in [`Role`] rows, each inheriting from the previous
/// entry in [`BUILTIN_ROLE_CHAIN`].
#[must_use]
pub fn builtin_roles() -> Vec<Role> {
    let mut roles = Vec::with_capacity(BUILTIN_ROLE_CHAIN.len());
    let mut parent: Option<String> = None;
    for name in BUILTIN_ROLE_CHAIN {
        roles.push(Role {
            role_name: name.to_string(),
            parent_role: parent.clone(),
            is_builtin: true,
        });
        parent = Some(name.to_string());
    }
    roles
}

/// A resolved caller: the authenticated user id, their assigned role, and
/// the groups they belong to. The implicit `public` group (id
/// [`kg_clock::PUBLIC_GROUP_ID`]) is not listed explicitly — callers append
/// it when evaluating resource grants via [`Identity::group_ids_with_public`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The authenticated user's id.
    pub user_id: i64,
    /// Login name, carried through for audit context.
    pub username: String,
    /// The role this identity was authenticated as.
    pub role: String,
    /// Explicit group memberships, not including the implicit public group.
    pub group_ids: Vec<i64>,
}

impl Identity {
    /// The groups relevant to a resource-grant check: explicit memberships
    /// plus the implicit public group every identity belongs to.
    #[must_use]
    pub fn group_ids_with_public(&self) -> Vec<i64> {
        let mut ids = self.group_ids.clone();
        ids.push(kg_clock::PUBLIC_GROUP_ID);
        ids
    }
}

/// The outcome of an authorisation check, grounded on the workspace's
/// `Decision` shape (same `allow()`/`deny(reason)` constructors).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the action is permitted.
    pub allowed: bool,
    /// Why the decision came out this way, for audit logs and API errors.
    pub reason: Option<String>,
}

impl Decision {
    /// An affirmative decision.
    #[must_use]
    pub fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    /// A negative decision with a human-readable reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }

    /// `true` if this decision permits the action.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// The instance-scoped facts an authorisation check is evaluated against:
/// the specific resource instance id (for `scope_type = instance`) and
/// attribute facts (for `scope_type = filter`, evaluated by
/// [`kg_rule_engine`]).
#[derive(Debug, Clone, Default)]
pub struct AuthorizationRequest {
    /// The specific resource instance being acted on, if any.
    pub resource_id: Option<String>,
    /// Attribute facts available for `scope_filter` predicate evaluation,
    /// e.g. `owner` (the resource's owning user id) and `is_system`.
    pub facts: Facts,
}

impl AuthorizationRequest {
    /// A request with no instance id and no facts, for global-only checks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the specific resource instance id being acted on.
    #[must_use]
    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    /// Attach an attribute fact for `scope_filter` evaluation.
    #[must_use]
    pub fn with_fact(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.facts.insert(key.into(), value);
        self
    }
}

/// Converts a `scope_filter` map into a [`Condition::And`] of equality/
/// truthiness checks (spec §4.8: "multiple keys combine with AND").
fn condition_from_scope_filter(filter: &BTreeMap<String, serde_json::Value>) -> Condition {
    let clauses: Vec<Condition> = filter
        .iter()
        .map(|(key, value)| {
            if value == &serde_json::Value::Bool(true) {
                Condition::Truthy { key: key.clone() }
            } else {
                Condition::Eq { key: key.clone(), value: value.clone() }
            }
        })
        .collect();
    match clauses.len() {
        0 => Condition::Always,
        1 => clauses.into_iter().next().unwrap(),
        _ => Condition::And(clauses),
    }
}

/// The authorisation kernel: role inheritance, role permissions, resource
/// grants, and resource metadata, held in memory and rebuilt from whatever
/// store backs `kg-core`'s RBAC rows (spec §4.8). Construction is cheap
/// enough to redo on every config/RBAC-table change.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationKernel {
    roles: BTreeMap<String, Role>,
    permissions: Vec<RolePermission>,
    grants: Vec<ResourceGrant>,
}

impl AuthorizationKernel {
    /// Build a kernel from the current RBAC rows.
    #[must_use]
    pub fn new(roles: Vec<Role>, permissions: Vec<RolePermission>, grants: Vec<ResourceGrant>) -> Self {
        Self {
            roles: roles.into_iter().map(|r| (r.role_name.clone(), r)).collect(),
            permissions,
            grants,
        }
    }

    /// The transitive closure of `role_name` and every role it inherits
    /// from via `parent_role`, narrowest first. Cycle-safe: a role already
    /// visited is never revisited.
    #[must_use]
    pub fn role_chain(&self, role_name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(role_name.to_string());
        while let Some(name) = current {
            if !visited.insert(name.clone()) {
                break;
            }
            let parent = self.roles.get(&name).and_then(|r| r.parent_role.clone());
            chain.push(name);
            current = parent;
        }
        chain
    }

    /// Resolve whether `identity` may perform `action` on `resource_type`,
    /// under `request`'s scope (spec §4.8).
    ///
    /// Evaluation order: walk the role chain collecting every matching
    /// [`RolePermission`]; an explicit deny anywhere in the chain wins over
    /// any allow found at another level. If no role permission matches at
    /// all, fall back to [`ResourceGrant`] rows for the identity's user id
    /// and groups (including the implicit public group). Absent all of
    /// that, the default is deny.
    #[must_use]
    pub fn authorize(
        &self,
        identity: &Identity,
        resource_type: &str,
        action: &str,
        request: &AuthorizationRequest,
    ) -> Decision {
        match self.resolve_role_permission(identity, resource_type, action, request) {
            Some(decision) => decision,
            None => self.resolve_resource_grant(identity, resource_type, action, request),
        }
    }

    fn resolve_role_permission(
        &self,
        identity: &Identity,
        resource_type: &str,
        action: &str,
        request: &AuthorizationRequest,
    ) -> Option<Decision> {
        let chain = self.role_chain(&identity.role);
        let matching: Vec<&RolePermission> = self
            .permissions
            .iter()
            .filter(|p| p.resource_type == resource_type && p.action == action && chain.contains(&p.role))
            .collect();

        if matching.is_empty() {
            return None;
        }

        if let Some(denied) = matching.iter().find(|p| !p.granted) {
            return Some(Decision::deny(format!(
                "role '{}' explicitly denies {action} on {resource_type}",
                denied.role
            )));
        }

        let allowed = matching.iter().filter(|p| p.granted).find(|p| self.scope_matches(p, request));
        match allowed {
            Some(permission) => Some(self.decision_for_scope(permission, request)),
            None => Some(Decision::deny(format!(
                "no matching scope for {action} on {resource_type} in role chain for '{}'",
                identity.role
            ))),
        }
    }

    fn scope_matches(&self, permission: &RolePermission, request: &AuthorizationRequest) -> bool {
        match permission.scope_type {
            ScopeType::Global => true,
            ScopeType::Instance => {
                permission.scope_id.is_some() && permission.scope_id == request.resource_id
            }
            ScopeType::Filter => permission
                .scope_filter
                .as_ref()
                .map(|filter| condition_from_scope_filter(filter).matches(&request.facts))
                .unwrap_or(false),
        }
    }

    fn decision_for_scope(&self, permission: &RolePermission, request: &AuthorizationRequest) -> Decision {
        if self.scope_matches(permission, request) {
            Decision::allow()
        } else {
            Decision::deny(format!(
                "scope '{:?}' on role '{}' does not cover this request",
                permission.scope_type, permission.role
            ))
        }
    }

    fn resolve_resource_grant(
        &self,
        identity: &Identity,
        resource_type: &str,
        action: &str,
        request: &AuthorizationRequest,
    ) -> Decision {
        let Some(resource_id) = request.resource_id.as_deref() else {
            return Decision::deny(format!("no role permission covers {action} on {resource_type}"));
        };
        let group_ids = identity.group_ids_with_public();
        let granted = self.grants.iter().any(|grant| {
            grant.resource_type == resource_type
                && grant.resource_id == resource_id
                && grant.permission == action
                && match grant.principal_type {
                    PrincipalType::User => grant.principal_id == identity.user_id,
                    PrincipalType::Group => group_ids.contains(&grant.principal_id),
                }
        });
        if granted {
            Decision::allow()
        } else {
            Decision::deny(format!(
                "no role permission or resource grant covers {action} on {resource_type}:{resource_id}"
            ))
        }
    }
}

/// Validates an opaque bearer token into an [`Identity`]. OAuth token
/// minting and refresh live outside this crate (spec §1 non-goals); this
/// trait is the narrow hook the daemon's auth middleware calls on every
/// request.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate `bearer_token`, returning the resolved identity, or `None`
    /// if the token is missing, expired, or otherwise invalid.
    async fn validate(&self, bearer_token: &str) -> Option<Identity>;
}

/// Deterministic in-memory [`TokenValidator`] test double: a fixed map from
/// token string to [`Identity`].
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: BTreeMap<String, Identity>,
}

impl StaticTokenValidator {
    /// An empty validator that accepts no tokens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as resolving to `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, bearer_token: &str) -> Option<Identity> {
        self.tokens.get(bearer_token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(role: &str) -> Identity {
        Identity { user_id: 42, username: "alice".into(), role: role.into(), group_ids: vec![] }
    }

    fn permission(role: &str, action: &str, scope_type: ScopeType, granted: bool) -> RolePermission {
        RolePermission {
            role: role.into(),
            resource_type: "job".into(),
            action: action.into(),
            scope_type,
            scope_id: None,
            scope_filter: None,
            granted,
        }
    }

    #[test]
    fn role_chain_walks_parent_and_is_cycle_safe() {
        let kernel = AuthorizationKernel::new(builtin_roles(), vec![], vec![]);
        let chain = kernel.role_chain("admin");
        assert_eq!(chain, vec!["admin", "curator", "contributor", "read_only"]);

        let cyclic = vec![
            Role { role_name: "a".into(), parent_role: Some("b".into()), is_builtin: false },
            Role { role_name: "b".into(), parent_role: Some("a".into()), is_builtin: false },
        ];
        let kernel = AuthorizationKernel::new(cyclic, vec![], vec![]);
        assert_eq!(kernel.role_chain("a"), vec!["a", "b"]);
    }

    #[test]
    fn global_permission_inherited_from_parent_role_is_allowed() {
        let kernel = AuthorizationKernel::new(
            builtin_roles(),
            vec![permission("contributor", "read", ScopeType::Global, true)],
            vec![],
        );
        let decision = kernel.authorize(&identity("curator"), "job", "read", &AuthorizationRequest::new());
        assert!(decision.is_allowed());
    }

    #[test]
    fn explicit_deny_overrides_allow_from_another_level() {
        let kernel = AuthorizationKernel::new(
            builtin_roles(),
            vec![
                permission("read_only", "delete", ScopeType::Global, true),
                permission("admin", "delete", ScopeType::Global, false),
            ],
            vec![],
        );
        let decision = kernel.authorize(&identity("admin"), "job", "delete", &AuthorizationRequest::new());
        assert!(!decision.is_allowed());
    }

    #[test]
    fn filter_scope_requires_matching_fact() {
        let mut permission = permission("contributor", "delete", ScopeType::Filter, true);
        permission.scope_filter = Some(BTreeMap::from([("owner".into(), json!("self"))]));
        let kernel = AuthorizationKernel::new(builtin_roles(), vec![permission], vec![]);

        let request = AuthorizationRequest::new().with_fact("owner", json!("self"));
        assert!(kernel.authorize(&identity("contributor"), "job", "delete", &request).is_allowed());

        let other_owner = AuthorizationRequest::new().with_fact("owner", json!("someone_else"));
        assert!(!kernel.authorize(&identity("contributor"), "job", "delete", &other_owner).is_allowed());
    }

    #[test]
    fn instance_scope_requires_matching_scope_id() {
        let mut permission = permission("contributor", "read", ScopeType::Instance, true);
        permission.scope_id = Some("job_1".into());
        let kernel = AuthorizationKernel::new(builtin_roles(), vec![permission], vec![]);

        let matching = AuthorizationRequest::new().with_resource_id("job_1");
        assert!(kernel.authorize(&identity("contributor"), "job", "read", &matching).is_allowed());

        let other = AuthorizationRequest::new().with_resource_id("job_2");
        assert!(!kernel.authorize(&identity("contributor"), "job", "read", &other).is_allowed());
    }

    #[test]
    fn resource_grant_fallback_covers_explicit_and_public_group_grants() {
        let kernel = AuthorizationKernel::new(
            builtin_roles(),
            vec![],
            vec![
                ResourceGrant {
                    resource_type: "artifact".into(),
                    resource_id: "art_1".into(),
                    principal_type: PrincipalType::User,
                    principal_id: 42,
                    permission: "read".into(),
                },
                ResourceGrant {
                    resource_type: "artifact".into(),
                    resource_id: "art_2".into(),
                    principal_type: PrincipalType::Group,
                    principal_id: kg_clock::PUBLIC_GROUP_ID,
                    permission: "read".into(),
                },
            ],
        );

        let request = AuthorizationRequest::new().with_resource_id("art_1");
        assert!(kernel.authorize(&identity("read_only"), "artifact", "read", &request).is_allowed());

        let public_request = AuthorizationRequest::new().with_resource_id("art_2");
        assert!(kernel.authorize(&identity("read_only"), "artifact", "read", &public_request).is_allowed());

        let unrelated = AuthorizationRequest::new().with_resource_id("art_3");
        assert!(!kernel.authorize(&identity("read_only"), "artifact", "read", &unrelated).is_allowed());
    }

    #[test]
    fn no_matching_permission_or_grant_is_deny_by_default() {
        let kernel = AuthorizationKernel::new(builtin_roles(), vec![], vec![]);
        let decision = kernel.authorize(&identity("read_only"), "job", "delete", &AuthorizationRequest::new());
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn static_token_validator_resolves_registered_tokens_only() {
        let validator = StaticTokenValidator::new().with_token("tok-1", identity("admin"));
        assert!(validator.validate("tok-1").await.is_some());
        assert!(validator.validate("unknown").await.is_none());
    }
}
