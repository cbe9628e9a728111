//! Channel labels: `<role>_<appId>_<useCase>_<function>`.
//!
//! The role prefix says which end opened the channel; stripping it gives the dedup key, so the
//! same logical channel is recognised from either end of the call.

use std::fmt;
use std::str::FromStr;

/// Role prefix of channels opened by this end.
pub const ROLE_LOCAL: &str = "local";
/// Role prefix of channels opened by the peer.
pub const ROLE_REMOTE: &str = "remote";
/// Use case of SDK-owned channels (control and own).
pub const SYSTEM_USE_CASE: &str = "sys";

const SEPARATOR: char = '_';

/// Last label segment. `control` and `own` are routed away from mini app listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelFunction {
    Control,
    Own,
    App(String),
}

impl ChannelFunction {
    pub fn parse(s: &str) -> Self {
        match s {
            "control" => ChannelFunction::Control,
            "own" => ChannelFunction::Own,
            other => ChannelFunction::App(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChannelFunction::Control => "control",
            ChannelFunction::Own => "own",
            ChannelFunction::App(s) => s,
        }
    }
}

/// Label with the role stripped: `<appId>_<useCase>_<function>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed channel label. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelLabel {
    role: String,
    app_id: String,
    use_case: String,
    function: ChannelFunction,
}

impl ChannelLabel {
    /// Build a label. Role, use case and function must be non-empty and free of `_`;
    /// the app id may contain `_`.
    pub fn new(
        role: &str,
        app_id: &str,
        use_case: &str,
        function: ChannelFunction,
    ) -> Result<Self, LabelError> {
        check_segment("role", role)?;
        if app_id.is_empty() {
            return Err(LabelError::EmptySegment("app id"));
        }
        check_segment("use case", use_case)?;
        check_segment("function", function.as_str())?;
        Ok(Self {
            role: role.to_string(),
            app_id: app_id.to_string(),
            use_case: use_case.to_string(),
            function,
        })
    }

    /// Control channel label for cross-peer start negotiation of `app_id`.
    pub fn control(role: &str, app_id: &str) -> Result<Self, LabelError> {
        Self::new(role, app_id, SYSTEM_USE_CASE, ChannelFunction::Control)
    }

    /// Own-channel label used for SDK-internal tunnelling.
    pub fn own(role: &str, app_id: &str) -> Result<Self, LabelError> {
        Self::new(role, app_id, SYSTEM_USE_CASE, ChannelFunction::Own)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn use_case(&self) -> &str {
        &self.use_case
    }

    pub fn function(&self) -> &ChannelFunction {
        &self.function
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.app_id,
            self.use_case,
            self.function.as_str()
        ))
    }

    /// Same label seen from the other role.
    pub fn with_role(&self, role: &str) -> Result<Self, LabelError> {
        Self::new(role, &self.app_id, &self.use_case, self.function.clone())
    }
}

fn check_segment(what: &'static str, s: &str) -> Result<(), LabelError> {
    if s.is_empty() {
        return Err(LabelError::EmptySegment(what));
    }
    if s.contains(SEPARATOR) {
        return Err(LabelError::Separator(what));
    }
    Ok(())
}

impl FromStr for ChannelLabel {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, rest) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| LabelError::Malformed(s.to_string()))?;
        let (rest, function) = rest
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| LabelError::Malformed(s.to_string()))?;
        let (app_id, use_case) = rest
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| LabelError::Malformed(s.to_string()))?;
        Self::new(role, app_id, use_case, ChannelFunction::parse(function))
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.role,
            self.app_id,
            self.use_case,
            self.function.as_str()
        )
    }
}

/// Dedup key of a raw label string.
pub fn dedup_key_of(label: &str) -> Result<DedupKey, LabelError> {
    label.parse::<ChannelLabel>().map(|l| l.dedup_key())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("malformed channel label: {0}")]
    Malformed(String),
    #[error("empty {0} in channel label")]
    EmptySegment(&'static str),
    #[error("{0} must not contain '_'")]
    Separator(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_four_segments() {
        let l: ChannelLabel = "local_weather_1_chat".parse().unwrap();
        assert_eq!(l.role(), "local");
        assert_eq!(l.app_id(), "weather");
        assert_eq!(l.use_case(), "1");
        assert_eq!(l.function(), &ChannelFunction::App("chat".into()));
        assert_eq!(l.to_string(), "local_weather_1_chat");
    }

    #[test]
    fn app_id_may_contain_separator() {
        let l: ChannelLabel = "remote_com_acme_game_2_state".parse().unwrap();
        assert_eq!(l.app_id(), "com_acme_game");
        assert_eq!(l.use_case(), "2");
        assert_eq!(l.dedup_key().as_str(), "com_acme_game_2_state");
    }

    #[test]
    fn dedup_key_ignores_role() {
        let a = dedup_key_of("local_weather_1_chat").unwrap();
        let b = dedup_key_of("remote_weather_1_chat").unwrap();
        let c = dedup_key_of("7_weather_1_chat").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn dedup_key_differs_on_function() {
        let a = dedup_key_of("local_weather_1_chat").unwrap();
        let b = dedup_key_of("local_weather_1_video").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn control_and_own_functions() {
        let c = ChannelLabel::control(ROLE_LOCAL, "weather").unwrap();
        assert_eq!(c.to_string(), "local_weather_sys_control");
        assert_eq!(c.function(), &ChannelFunction::Control);
        let o: ChannelLabel = "remote_sdk_sys_own".parse().unwrap();
        assert_eq!(o.function(), &ChannelFunction::Own);
    }

    #[test]
    fn with_role_keeps_dedup_key() {
        let l = ChannelLabel::control(ROLE_LOCAL, "weather").unwrap();
        let r = l.with_role(ROLE_REMOTE).unwrap();
        assert_eq!(r.role(), ROLE_REMOTE);
        assert_eq!(l.dedup_key(), r.dedup_key());
    }

    #[test]
    fn malformed_labels_rejected() {
        assert!(matches!(
            "nounderscore".parse::<ChannelLabel>(),
            Err(LabelError::Malformed(_))
        ));
        assert!(matches!(
            "local_app_chat".parse::<ChannelLabel>(),
            Err(LabelError::EmptySegment(_)) | Err(LabelError::Malformed(_))
        ));
        assert!(matches!(
            "local__1_chat".parse::<ChannelLabel>(),
            Err(LabelError::EmptySegment("app id"))
        ));
        assert!(ChannelLabel::new("lo_cal", "a", "1", ChannelFunction::Control).is_err());
    }
}
