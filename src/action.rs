use serde::Serialize;
use serde_json::Value;

/// Action kind dispatched once when a reducer is installed without an
/// explicit initial state, so the reducer can produce its own default.
pub const INIT_KIND: &str = "@@karakuri/INIT";

/// Action kind delivered to `take_maybe` waiters when the run shuts down
/// while the wait is still outstanding.
pub const END_KIND: &str = "@@karakuri/END";

/// A plain message dispatched into the simulated store.
///
/// Actions carry a string `kind` and an arbitrary JSON payload. Equality is
/// deep structural equality over both fields, which is what take-pattern
/// matching and expectation matching rely on.
///
/// # Example
///
/// ```rust
/// use karakuri::Action;
/// use serde_json::json;
///
/// let a = Action::of("ORDER_PLACED").with_payload(json!({ "id": 7 }));
/// assert_eq!(a.kind(), "ORDER_PLACED");
/// assert_eq!(a.payload()["id"], 7);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    kind: String,
    payload: Value,
}

impl Action {
    /// Create an action with the given kind and no payload.
    pub fn of(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
        }
    }

    /// Attach a payload, replacing any existing one.
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[inline]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The terminal action delivered to optional waits on shutdown.
    pub fn end() -> Self {
        Action::of(END_KIND)
    }

    /// Whether this is the terminal action.
    pub fn is_end(&self) -> bool {
        self.kind == END_KIND
    }

    pub(crate) fn init() -> Self {
        Action::of(INIT_KIND)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.payload.is_null() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}({})", self.kind, self.payload)
        }
    }
}

/// What a wait-for-action effect (or an action channel) matches against.
///
/// Patterns are pure data so effect descriptors stay deeply comparable:
///
/// - [`Pattern::Any`] matches every action
/// - [`Pattern::Kind`] matches actions with exactly that kind
/// - [`Pattern::OneOf`] matches actions with any of the listed kinds
///
/// `&str` and `String` convert into `Pattern::Kind` for convenience.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Pattern {
    Any,
    Kind(String),
    OneOf(Vec<String>),
}

impl Pattern {
    /// Build a [`Pattern::OneOf`] from any iterator of kinds.
    pub fn one_of<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Pattern::OneOf(kinds.into_iter().map(Into::into).collect())
    }

    /// Returns true if the given action's kind matches this pattern.
    pub fn matches(&self, action: &Action) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Kind(kind) => action.kind() == kind,
            Pattern::OneOf(kinds) => kinds.iter().any(|k| action.kind() == k),
        }
    }
}

impl From<&str> for Pattern {
    fn from(kind: &str) -> Self {
        Pattern::Kind(kind.to_owned())
    }
}

impl From<String> for Pattern {
    fn from(kind: String) -> Self {
        Pattern::Kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_is_deep() {
        let a = Action::of("A").with_payload(json!({ "x": [1, 2, 3] }));
        let b = Action::of("A").with_payload(json!({ "x": [1, 2, 3] }));
        let c = Action::of("A").with_payload(json!({ "x": [1, 2] }));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn kind_pattern_matches_exact_kind() {
        let pattern: Pattern = "PING".into();
        assert!(pattern.matches(&Action::of("PING")));
        assert!(!pattern.matches(&Action::of("PONG")));
    }

    #[test]
    fn any_pattern_matches_everything() {
        assert!(Pattern::Any.matches(&Action::of("WHATEVER")));
        assert!(Pattern::Any.matches(&Action::end()));
    }

    #[test]
    fn one_of_pattern_matches_listed_kinds() {
        let pattern = Pattern::one_of(["A", "B"]);
        assert!(pattern.matches(&Action::of("A")));
        assert!(pattern.matches(&Action::of("B")));
        assert!(!pattern.matches(&Action::of("C")));
    }

    #[test]
    fn end_action_is_terminal() {
        assert!(Action::end().is_end());
        assert!(!Action::of("A").is_end());
    }
}
