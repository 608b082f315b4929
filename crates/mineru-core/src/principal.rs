//! The resolved identity a request or worker acts as.
//!
//! The facade resolves a `Principal` from trusted upstream headers before
//! handlers run; the CLI constructs one locally for operator commands.
//! Auth itself (how the headers got trusted) is out of scope here.

/// A permission a principal may hold, beyond the baseline
/// owner-scoped access to their own tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// May list/get/cancel tasks owned by any user, not just their own.
    QueueViewGlobal,
    /// May read queue-wide aggregate statistics (`GET /queue/stats`).
    QueueView,
    /// May submit new tasks.
    TaskSubmit,
    /// May invoke the admin maintenance endpoints.
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: String,
    pub permissions: Vec<Permission>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        let role = role.into();
        let permissions = permissions_for_role(&role);
        Self {
            user_id: user_id.into(),
            role,
            permissions,
        }
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// A principal with unrestricted queue visibility and admin rights,
    /// used by CLI commands invoked by whoever can reach the machine.
    pub fn local_superuser() -> Self {
        Self {
            user_id: "local-operator".to_string(),
            role: "admin".to_string(),
            permissions: vec![
                Permission::QueueViewGlobal,
                Permission::QueueView,
                Permission::TaskSubmit,
                Permission::Admin,
            ],
        }
    }
}

/// Map a trusted `X-User-Role` value to the permissions it grants.
///
/// Unrecognized roles get nothing, not even `TaskSubmit` -- an upstream
/// proxy that sends a role we don't recognize is treated as untrusted
/// rather than defaulted to the common case.
fn permissions_for_role(role: &str) -> Vec<Permission> {
    match role {
        "admin" => vec![
            Permission::QueueViewGlobal,
            Permission::QueueView,
            Permission::TaskSubmit,
            Permission::Admin,
        ],
        "operator" => vec![Permission::QueueViewGlobal, Permission::QueueView, Permission::TaskSubmit],
        "user" => vec![Permission::TaskSubmit],
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_grants_all_permissions() {
        let p = Principal::new("u1", "admin");
        assert!(p.has(Permission::QueueViewGlobal));
        assert!(p.has(Permission::QueueView));
        assert!(p.has(Permission::TaskSubmit));
        assert!(p.has(Permission::Admin));
    }

    #[test]
    fn operator_role_grants_view_and_submit_but_not_admin() {
        let p = Principal::new("u1", "operator");
        assert!(p.has(Permission::QueueViewGlobal));
        assert!(p.has(Permission::QueueView));
        assert!(p.has(Permission::TaskSubmit));
        assert!(!p.has(Permission::Admin));
    }

    #[test]
    fn user_role_grants_submit_only() {
        let p = Principal::new("u1", "user");
        assert!(p.has(Permission::TaskSubmit));
        assert!(!p.has(Permission::QueueViewGlobal));
        assert!(!p.has(Permission::QueueView));
        assert!(!p.has(Permission::Admin));
    }

    #[test]
    fn unknown_role_grants_nothing() {
        let p = Principal::new("u1", "viewer");
        assert!(!p.has(Permission::QueueViewGlobal));
        assert!(!p.has(Permission::TaskSubmit));
        assert!(!p.has(Permission::Admin));
    }

    #[test]
    fn local_superuser_has_full_access() {
        let p = Principal::local_superuser();
        assert!(p.has(Permission::QueueViewGlobal));
        assert!(p.has(Permission::QueueView));
        assert!(p.has(Permission::TaskSubmit));
        assert!(p.has(Permission::Admin));
    }
}
