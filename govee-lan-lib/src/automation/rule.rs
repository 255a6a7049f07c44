use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context};
use chrono::NaiveTime;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Checks that `time` is a zero-padded 24-hour `HH:MM` string.
pub fn validate_time(time: &str) -> anyhow::Result<()> {
    let parsed = NaiveTime::parse_from_str(time, "%H:%M")
        .with_context(|| format!("Invalid time {:?}, expected HH:MM", time))?;
    if parsed.format("%H:%M").to_string() != time {
        bail!("Invalid time {:?}, expected zero-padded HH:MM", time);
    }
    Ok(())
}

/// The closed set of things a rule can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    PowerOn,
    PowerOff,
    /// Brightness percentage; the client clamps it on send.
    Brightness(i64),
    Rgb(i64, i64, i64),
}

impl RuleAction {
    /// The `action` string used in rule files.
    pub fn name(&self) -> &'static str {
        match self {
            RuleAction::PowerOn => "on",
            RuleAction::PowerOff => "off",
            RuleAction::Brightness(_) => "brightness",
            RuleAction::Rgb(..) => "rgb",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::PowerOn => write!(f, "TURN ON"),
            RuleAction::PowerOff => write!(f, "TURN OFF"),
            RuleAction::Brightness(value) => write!(f, "BRIGHTNESS {}%", value),
            RuleAction::Rgb(r, g, b) => write!(f, "RGB({},{},{})", r, g, b),
        }
    }
}

/**
A daily rule as stored in a rule file.

The action fields are kept loosely typed, exactly as persisted, and only
turned into a [`RuleAction`] when the rule fires. A rule with an unknown
action or a missing field therefore fails on its own without affecting the
rest of the rule set.
 */
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AutomationRule {
    /// `HH:MM`, compared verbatim against the current minute.
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<Value>,
    /// Fields this crate does not interpret, preserved on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn int_field(name: &str, field: &Option<Value>) -> anyhow::Result<i64> {
    let value = field
        .as_ref()
        .ok_or_else(|| anyhow!("Missing field {:?}", name))?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| anyhow!("Field {:?} is out of range: {}", name, n)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .with_context(|| format!("Field {:?} is not an integer: {:?}", name, s)),
        other => bail!("Field {:?} is not an integer: {}", name, other),
    }
}

impl AutomationRule {
    /// Builds a rule from a typed action, validating the time.
    pub fn new(time: &str, action: RuleAction) -> anyhow::Result<Self> {
        validate_time(time)?;
        let mut rule = AutomationRule {
            time: time.to_string(),
            action: action.name().to_string(),
            ..AutomationRule::default()
        };
        match action {
            RuleAction::PowerOn | RuleAction::PowerOff => {}
            RuleAction::Brightness(value) => rule.value = Some(value.into()),
            RuleAction::Rgb(r, g, b) => {
                rule.r = Some(r.into());
                rule.g = Some(g.into());
                rule.b = Some(b.into());
            }
        }
        Ok(rule)
    }

    /// Interprets the stored action.
    pub fn to_action(&self) -> anyhow::Result<RuleAction> {
        match self.action.as_str() {
            "on" => Ok(RuleAction::PowerOn),
            "off" => Ok(RuleAction::PowerOff),
            "brightness" => Ok(RuleAction::Brightness(int_field("value", &self.value)?)),
            "rgb" => Ok(RuleAction::Rgb(
                int_field("r", &self.r)?,
                int_field("g", &self.g)?,
                int_field("b", &self.b)?,
            )),
            other => bail!("Unknown action: {:?}", other),
        }
    }
}

/// The persisted rule file: a device address and an ordered rule list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub device_ip: String,
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
}

impl RuleSet {
    /// Reads a rule file, dropping rules without a time or an action.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules from {}", path.display()))?;
        let mut rule_set: RuleSet = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse rules from {}", path.display()))?;

        let before = rule_set.rules.len();
        rule_set
            .rules
            .retain(|rule| !rule.time.is_empty() && !rule.action.is_empty());
        if rule_set.rules.len() != before {
            warn!(
                "Dropped {} rule(s) without a time or action from {}",
                before - rule_set.rules.len(),
                path.display()
            );
        }
        Ok(rule_set)
    }

    /// Writes the rule file via a temporary file and a rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/**
Shared, swappable rule sequence.

Readers take an immutable [`RuleBook::snapshot`]; writers build a new sequence
and swap it in whole, so a running scheduler never observes a half-edited
list.
 */
#[derive(Debug, Clone)]
pub struct RuleBook {
    rules: Arc<RwLock<Arc<[AutomationRule]>>>,
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RuleBook {
    pub fn new(rules: Vec<AutomationRule>) -> Self {
        RuleBook {
            rules: Arc::new(RwLock::new(rules.into())),
        }
    }

    pub fn snapshot(&self) -> Arc<[AutomationRule]> {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, rules: Vec<AutomationRule>) {
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = rules.into();
    }

    pub fn push(&self, rule: AutomationRule) {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        let mut updated = rules.to_vec();
        updated.push(rule);
        *rules = updated.into();
    }

    /// Removes the rule at `index`, shifting later rules down.
    pub fn remove(&self, index: usize) -> Option<AutomationRule> {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        if index >= rules.len() {
            return None;
        }
        let mut updated = rules.to_vec();
        let removed = updated.remove(index);
        *rules = updated.into();
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_time() {
        assert!(validate_time("18:00").is_ok());
        assert!(validate_time("00:05").is_ok());
        assert!(validate_time("8:00").is_err());
        assert!(validate_time("24:00").is_err());
        assert!(validate_time("18:00:30").is_err());
        assert!(validate_time("evening").is_err());
    }

    #[test]
    fn test_persisted_rules_convert_to_actions() {
        let rules: Vec<AutomationRule> = serde_json::from_value(json!([
            { "time": "07:00", "action": "on" },
            { "time": "07:01", "action": "brightness", "value": 40 },
            { "time": "07:02", "action": "rgb", "r": 255, "g": "128", "b": 0 },
            { "time": "23:00", "action": "off", "type": "daily" }
        ]))
        .unwrap();

        let actions: Vec<RuleAction> = rules.iter().map(|r| r.to_action().unwrap()).collect();
        assert_eq!(
            actions,
            vec![
                RuleAction::PowerOn,
                RuleAction::Brightness(40),
                RuleAction::Rgb(255, 128, 0),
                RuleAction::PowerOff,
            ]
        );
        assert_eq!(rules[3].extra["type"], json!("daily"));
    }

    #[test]
    fn test_invalid_rules_fail_at_conversion() {
        let unknown = AutomationRule {
            time: "07:00".to_string(),
            action: "strobe".to_string(),
            ..AutomationRule::default()
        };
        assert!(unknown.to_action().is_err());

        let missing = AutomationRule {
            time: "07:00".to_string(),
            action: "rgb".to_string(),
            r: Some(json!(1)),
            ..AutomationRule::default()
        };
        let err = missing.to_action().unwrap_err().to_string();
        assert!(err.contains("\"g\""), "{}", err);
    }

    #[test]
    fn test_new_rule_serializes_to_file_shape() {
        let rule = AutomationRule::new("18:00", RuleAction::Rgb(1, 2, 3)).unwrap();
        assert_eq!(
            serde_json::to_value(&rule).unwrap(),
            json!({ "time": "18:00", "action": "rgb", "r": 1, "g": 2, "b": 3 })
        );
        assert!(AutomationRule::new("6pm", RuleAction::PowerOn).is_err());
    }

    #[test]
    fn test_rule_set_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let rule_set = RuleSet {
            device_ip: "192.168.1.66".to_string(),
            rules: vec![
                AutomationRule::new("18:00", RuleAction::PowerOn).unwrap(),
                AutomationRule::new("18:30", RuleAction::Brightness(20)).unwrap(),
            ],
        };

        rule_set.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(RuleSet::load(&path).unwrap(), rule_set);
    }

    #[test]
    fn test_load_drops_incomplete_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(
            &path,
            r#"{"device_ip":"10.0.0.5","rules":[{"time":"07:00"},{"action":"on"},{"time":"08:00","action":"off"}]}"#,
        )
        .unwrap();

        let rule_set = RuleSet::load(&path).unwrap();
        assert_eq!(rule_set.rules.len(), 1);
        assert_eq!(rule_set.rules[0].time, "08:00");
    }

    #[test]
    fn test_rule_book_swaps_whole_sequence() {
        let book = RuleBook::new(vec![AutomationRule::new("01:00", RuleAction::PowerOn).unwrap()]);
        let before = book.snapshot();

        book.push(AutomationRule::new("02:00", RuleAction::PowerOff).unwrap());
        assert_eq!(before.len(), 1);
        assert_eq!(book.len(), 2);

        let removed = book.remove(0).unwrap();
        assert_eq!(removed.time, "01:00");
        assert_eq!(book.snapshot()[0].time, "02:00");
        assert!(book.remove(5).is_none());

        book.replace(Vec::new());
        assert!(book.is_empty());
    }
}
