//! Role-gated navigation.
//!
//! [`RouteGuard`] decides whether a protected subtree may be shown for the
//! current session. [`Router`] applies the client route table on top of it.

use tracing::debug;

use crate::auth::SessionState;
use crate::models::Role;

pub const LOGIN_ROUTE: &str = "/login";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Session restore has not finished; show a neutral placeholder.
    Loading,
    Redirect(String),
    Render,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteGuard {
    allowed_roles: Vec<Role>,
}

impl RouteGuard {
    pub fn new(allowed_roles: &[Role]) -> Self {
        Self {
            allowed_roles: allowed_roles.to_vec(),
        }
    }

    pub fn allows(&self, role: Role) -> bool {
        self.allowed_roles.contains(&role)
    }

    pub fn evaluate(&self, state: &SessionState) -> GuardDecision {
        if state.loading {
            return GuardDecision::Loading;
        }
        match state.session {
            None => GuardDecision::Redirect(LOGIN_ROUTE.to_string()),
            // Wrong-role users go to their own dashboard
            Some(ref session) if !self.allows(session.role) => {
                GuardDecision::Redirect(session.role.home_route().to_string())
            }
            Some(_) => GuardDecision::Render,
        }
    }
}

/// Outcome of resolving a path against the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Loading,
    Redirect(String),
    Render(Page),
    NotFound,
}

/// Top-level views the client knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Login,
    SignUp,
    ForgotPassword,
    Logout,
    /// A dashboard view; `section` is the remainder of the path
    /// (`""` for the index, e.g. `"courses/materials"`).
    Dashboard { role: Role, section: String },
}

#[derive(Debug, Clone, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, path: &str, state: &SessionState) -> Resolution {
        let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
        let trimmed = path.trim_end_matches('/');

        let resolution = match trimmed {
            "" => Resolution::Redirect(LOGIN_ROUTE.to_string()),
            "/login" => Resolution::Render(Page::Login),
            "/signup" => Resolution::Render(Page::SignUp),
            "/forgot-password" => Resolution::Render(Page::ForgotPassword),
            "/logout" => Resolution::Render(Page::Logout),
            _ => match Self::dashboard(trimmed) {
                Some((role, section)) => match RouteGuard::new(&[role]).evaluate(state) {
                    GuardDecision::Loading => Resolution::Loading,
                    GuardDecision::Redirect(to) => Resolution::Redirect(to),
                    GuardDecision::Render => Resolution::Render(Page::Dashboard {
                        role,
                        section: section.to_string(),
                    }),
                },
                None => Resolution::NotFound,
            },
        };

        debug!(path, ?resolution, "Route resolved");
        resolution
    }

    fn dashboard(path: &str) -> Option<(Role, &str)> {
        Role::ALL.into_iter().find_map(|role| {
            let rest = path.strip_prefix(role.home_route())?;
            if rest.is_empty() {
                Some((role, ""))
            } else {
                rest.strip_prefix('/').map(|section| (role, section))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::make_token;
    use crate::auth::Session;
    use serde_json::json;

    fn state(loading: bool, role: Option<Role>) -> SessionState {
        SessionState {
            loading,
            session: role.map(|role| {
                Session::from_token(make_token(&json!({"sub": "u-1"})), role, "Ada".to_string())
                    .unwrap()
            }),
        }
    }

    #[test]
    fn test_guard_loading_wins_over_everything() {
        let guard = RouteGuard::new(&[Role::Teacher]);
        assert_eq!(guard.evaluate(&state(true, None)), GuardDecision::Loading);
        assert_eq!(guard.evaluate(&state(true, Some(Role::Teacher))), GuardDecision::Loading);
        assert_eq!(guard.evaluate(&state(true, Some(Role::Student))), GuardDecision::Loading);
    }

    #[test]
    fn test_guard_without_session_redirects_to_login() {
        let guard = RouteGuard::new(&[Role::Teacher]);
        assert_eq!(
            guard.evaluate(&state(false, None)),
            GuardDecision::Redirect("/login".to_string())
        );
    }

    #[test]
    fn test_guard_wrong_role_goes_home() {
        let guard = RouteGuard::new(&[Role::Teacher]);
        assert_eq!(
            guard.evaluate(&state(false, Some(Role::Student))),
            GuardDecision::Redirect("/student-dashboard".to_string())
        );
    }

    #[test]
    fn test_guard_allowed_role_renders() {
        let guard = RouteGuard::new(&[Role::Teacher]);
        assert_eq!(guard.evaluate(&state(false, Some(Role::Teacher))), GuardDecision::Render);

        let both = RouteGuard::new(&Role::ALL);
        assert_eq!(both.evaluate(&state(false, Some(Role::Student))), GuardDecision::Render);
    }

    #[test]
    fn test_router_public_routes() {
        let router = Router::new();
        let anon = state(false, None);
        assert_eq!(router.resolve("/", &anon), Resolution::Redirect("/login".to_string()));
        assert_eq!(router.resolve("/login", &anon), Resolution::Render(Page::Login));
        assert_eq!(router.resolve("/signup/", &anon), Resolution::Render(Page::SignUp));
        assert_eq!(
            router.resolve("/forgot-password?step=2", &anon),
            Resolution::Render(Page::ForgotPassword)
        );
        assert_eq!(router.resolve("/nowhere", &anon), Resolution::NotFound);
    }

    #[test]
    fn test_router_dashboards() {
        let router = Router::new();
        let teacher = state(false, Some(Role::Teacher));

        assert_eq!(
            router.resolve("/teacher-dashboard/courses/42/manage", &teacher),
            Resolution::Render(Page::Dashboard {
                role: Role::Teacher,
                section: "courses/42/manage".to_string()
            })
        );
        assert_eq!(
            router.resolve("/teacher-dashboard", &teacher),
            Resolution::Render(Page::Dashboard { role: Role::Teacher, section: String::new() })
        );
        assert_eq!(
            router.resolve("/student-dashboard/courses", &teacher),
            Resolution::Redirect("/teacher-dashboard".to_string())
        );
        assert_eq!(
            router.resolve("/student-dashboard", &state(false, None)),
            Resolution::Redirect("/login".to_string())
        );
        assert_eq!(router.resolve("/student-dashboard", &state(true, None)), Resolution::Loading);
        // Prefix lookalikes are not dashboards
        assert_eq!(router.resolve("/student-dashboardx", &teacher), Resolution::NotFound);
    }
}
