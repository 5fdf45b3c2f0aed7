use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::rate_limiter::ThrottleParams;

/// Maximum length of the page title.
pub const MAX_PAGETITLE_LENGTH: usize = 100;
/// Maximum length of external stylesheet / script links.
pub const MAX_EXTERNAL_LINK_LENGTH: usize = 255;
/// Maximum length of a room password.
pub const MAX_PASSWORD_LENGTH: usize = 100;

/// Room-level settings. Serialized as the `channelOpts` payload and stored in
/// snapshots; deserialization ignores unknown keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    pub allow_voteskip: bool,
    /// Fraction of eligible members needed to skip.
    pub voteskip_ratio: f64,
    /// Seconds of inactivity before a member is marked AFK.
    pub afk_timeout: u64,
    pub pagetitle: String,
    /// Longest media (seconds) members without `exceedmaxlength` may queue. 0 = unlimited.
    pub maxlength: u64,
    pub externalcss: String,
    pub externaljs: String,
    pub chat_antiflood: bool,
    pub chat_antiflood_params: ThrottleParams,
    pub show_public: bool,
    pub enable_link_regex: bool,
    /// Wrap to the head of the playlist after the last item.
    pub playlist_loop: bool,
    #[serde(
        serialize_with = "serialize_password",
        deserialize_with = "deserialize_password"
    )]
    pub password: Option<String>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            allow_voteskip: true,
            voteskip_ratio: 0.5,
            afk_timeout: 600,
            pagetitle: String::new(),
            maxlength: 0,
            externalcss: String::new(),
            externaljs: String::new(),
            chat_antiflood: false,
            chat_antiflood_params: ThrottleParams {
                burst: 4.0,
                sustained: 1.0,
                cooldown: 4.0,
            },
            show_public: false,
            enable_link_regex: true,
            playlist_loop: true,
            password: None,
        }
    }
}

/// Clients expect `false` when no password is set.
fn serialize_password<S: Serializer>(pw: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    match pw {
        Some(pw) => s.serialize_str(pw),
        None => s.serialize_bool(false),
    }
}

fn deserialize_password<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    })
}

/// Why an option update was partially refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionWarning {
    ReservedPageTitle,
}

impl ChannelOptions {
    pub fn with_pagetitle(pagetitle: &str) -> Self {
        Self {
            pagetitle: pagetitle.to_string(),
            ..Self::default()
        }
    }

    /// Rebuild options from a stored object: defaults first, then every
    /// recognised key whose value has the right shape. A key with the wrong
    /// shape keeps its current value instead of failing the whole load.
    pub fn merge_from(&mut self, value: &Value) {
        let Some(stored) = value.as_object() else {
            return;
        };
        let Ok(Value::Object(mut current)) = serde_json::to_value(&*self) else {
            return;
        };
        for (key, v) in stored {
            if !current.contains_key(key) {
                continue;
            }
            let previous = current.insert(key.clone(), v.clone());
            if serde_json::from_value::<ChannelOptions>(Value::Object(current.clone())).is_err()
                && let Some(previous) = previous
            {
                current.insert(key.clone(), previous);
            }
        }
        if let Ok(merged) = serde_json::from_value(Value::Object(current)) {
            *self = merged;
        }
    }

    /// Apply a moderator's `setOptions` request. Admin-only keys are skipped
    /// unless `is_admin`. Malformed numbers clamp to safe values.
    pub fn apply_update(
        &mut self,
        data: &Map<String, Value>,
        is_admin: bool,
        reserved_titles: Option<&Regex>,
    ) -> Vec<OptionWarning> {
        let mut warnings = Vec::new();

        if let Some(v) = data.get("allow_voteskip") {
            self.allow_voteskip = truthy(v);
        }

        if let Some(v) = data.get("voteskip_ratio") {
            self.voteskip_ratio = parse_f64(v).filter(|r| *r >= 0.0).unwrap_or(0.0);
        }

        if let Some(v) = data.get("afk_timeout") {
            self.afk_timeout = parse_u64(v).unwrap_or(0);
        }

        if is_admin && let Some(v) = data.get("pagetitle") {
            let title = truncate(&stringify(v), MAX_PAGETITLE_LENGTH);
            let reserved = reserved_titles.is_some_and(|re| re.is_match(title.trim()));
            if reserved {
                warnings.push(OptionWarning::ReservedPageTitle);
            } else {
                self.pagetitle = title;
            }
        }

        if let Some(v) = data.get("maxlength") {
            self.maxlength = parse_u64(v).unwrap_or(0);
        }

        if is_admin && let Some(v) = data.get("externalcss") {
            self.externalcss = truncate(&stringify(v), MAX_EXTERNAL_LINK_LENGTH);
        }

        if is_admin && let Some(v) = data.get("externaljs") {
            self.externaljs = truncate(&stringify(v), MAX_EXTERNAL_LINK_LENGTH);
        }

        if let Some(v) = data.get("chat_antiflood") {
            self.chat_antiflood = truthy(v);
        }

        if let Some(v) = data.get("chat_antiflood_params") {
            let burst = v
                .get("burst")
                .and_then(parse_u64)
                .map(|b| b as f64)
                .unwrap_or(1.0);
            let sustained = v
                .get("sustained")
                .and_then(parse_u64)
                .filter(|s| *s > 0)
                .map(|s| s as f64)
                .unwrap_or(1.0);
            self.chat_antiflood_params = ThrottleParams {
                burst,
                sustained,
                cooldown: burst / sustained,
            };
        }

        if is_admin && let Some(v) = data.get("show_public") {
            self.show_public = truthy(v);
        }

        if let Some(v) = data.get("enable_link_regex") {
            self.enable_link_regex = truthy(v);
        }

        if let Some(v) = data.get("playlist_loop") {
            self.playlist_loop = truthy(v);
        }

        if is_admin && let Some(v) = data.get("password") {
            let pw = match v {
                Value::Bool(false) | Value::Null => String::new(),
                other => stringify(other),
            };
            self.password = if pw.is_empty() {
                None
            } else {
                Some(truncate(&pw, MAX_PASSWORD_LENGTH))
            };
        }

        warnings
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
        Value::Null => false,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn parse_u64(v: &Value) -> Option<u64> {
    parse_f64(v).filter(|f| *f >= 0.0).map(|f| f.trunc() as u64)
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_password_serializes_as_false_when_unset() {
        let opts = ChannelOptions::default();
        let v = serde_json::to_value(&opts).unwrap();
        assert_eq!(v["password"], json!(false));

        let opts = ChannelOptions {
            password: Some("hunter2".into()),
            ..ChannelOptions::default()
        };
        let v = serde_json::to_value(&opts).unwrap();
        assert_eq!(v["password"], json!("hunter2"));
    }

    #[test]
    fn test_merge_ignores_unknown_and_bad_shapes() {
        let mut opts = ChannelOptions::with_pagetitle("Room");
        opts.merge_from(&json!({
            "maxlength": 600,
            "voteskip_ratio": "lots",
            "not_an_option": true,
            "password": false
        }));
        assert_eq!(opts.maxlength, 600);
        assert_eq!(opts.voteskip_ratio, 0.5);
        assert_eq!(opts.pagetitle, "Room");
        assert_eq!(opts.password, None);
    }

    #[test]
    fn test_update_clamps_numbers() {
        let mut opts = ChannelOptions::default();
        opts.apply_update(
            &obj(json!({"voteskip_ratio": -3, "afk_timeout": "abc", "maxlength": "90"})),
            false,
            None,
        );
        assert_eq!(opts.voteskip_ratio, 0.0);
        assert_eq!(opts.afk_timeout, 0);
        assert_eq!(opts.maxlength, 90);
    }

    #[test]
    fn test_admin_only_keys_need_admin() {
        let mut opts = ChannelOptions::default();
        let data = obj(json!({"pagetitle": "Mine", "show_public": true, "password": "pw"}));
        opts.apply_update(&data, false, None);
        assert_eq!(opts.pagetitle, "");
        assert!(!opts.show_public);
        assert_eq!(opts.password, None);

        opts.apply_update(&data, true, None);
        assert_eq!(opts.pagetitle, "Mine");
        assert!(opts.show_public);
        assert_eq!(opts.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_reserved_pagetitle_refused() {
        let re = Regex::new("(?i)^admin$").unwrap();
        let mut opts = ChannelOptions::with_pagetitle("old");
        let warnings =
            opts.apply_update(&obj(json!({"pagetitle": " Admin "})), true, Some(&re));
        assert_eq!(warnings, vec![OptionWarning::ReservedPageTitle]);
        assert_eq!(opts.pagetitle, "old");
    }

    #[test]
    fn test_antiflood_params_derive_cooldown() {
        let mut opts = ChannelOptions::default();
        opts.apply_update(
            &obj(json!({"chat_antiflood_params": {"burst": 6, "sustained": 2}})),
            false,
            None,
        );
        assert_eq!(opts.chat_antiflood_params.burst, 6.0);
        assert_eq!(opts.chat_antiflood_params.sustained, 2.0);
        assert_eq!(opts.chat_antiflood_params.cooldown, 3.0);

        opts.apply_update(
            &obj(json!({"chat_antiflood_params": {"burst": -1, "sustained": 0}})),
            false,
            None,
        );
        assert_eq!(opts.chat_antiflood_params.burst, 1.0);
        assert_eq!(opts.chat_antiflood_params.sustained, 1.0);
    }

    #[test]
    fn test_empty_password_clears() {
        let mut opts = ChannelOptions {
            password: Some("x".into()),
            ..ChannelOptions::default()
        };
        opts.apply_update(&obj(json!({"password": ""})), true, None);
        assert_eq!(opts.password, None);
    }
}
