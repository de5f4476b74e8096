use crate::driver::Locator;
use crate::snapshot::ViewNode;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;

/// Structural predicate over a single view node.
///
/// Every field that is set must match; an all-empty selector matches nothing.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Selector {
    /// Resource id, fully qualified or the bare name after `:id/`.
    pub resource_id: Option<String>,
    /// Visible text (case-insensitive, trimmed).
    pub text: Option<String>,
    /// Accessibility description (case-insensitive, trimmed).
    pub description: Option<String>,
    /// Widget class name.
    pub class: Option<String>,
}

impl Selector {
    pub fn resource_id(id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resource_id.is_none()
            && self.text.is_none()
            && self.description.is_none()
            && self.class.is_none()
    }

    pub fn matches(&self, node: &ViewNode) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(ref want) = self.resource_id {
            match node.resource_id.as_deref() {
                Some(id) if resource_id_matches(id, want) => {}
                _ => return false,
            }
        }
        if let Some(ref want) = self.text {
            if !text_matches(node.text.as_deref(), want) {
                return false;
            }
        }
        if let Some(ref want) = self.description {
            if !text_matches(node.content_desc.as_deref(), want) {
                return false;
            }
        }
        if let Some(ref want) = self.class {
            if node.class.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        true
    }

    /// Locator used to tap whatever this selector describes.
    pub fn to_locator(&self) -> Option<Locator> {
        if let Some(ref id) = self.resource_id {
            return Some(Locator::ResourceId(id.clone()));
        }
        if let Some(ref text) = self.text {
            return Some(Locator::Text(text.clone()));
        }
        self.description
            .as_ref()
            .map(|d| Locator::Description(d.clone()))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.resource_id, &self.text, &self.description) {
            (Some(id), _, _) => write!(f, "id '{}'", id),
            (_, Some(t), _) => write!(f, "text '{}'", t),
            (_, _, Some(d)) => write!(f, "description '{}'", d),
            _ => match self.class {
                Some(ref c) => write!(f, "class '{}'", c),
                None => write!(f, "empty selector"),
            },
        }
    }
}

fn resource_id_matches(actual: &str, want: &str) -> bool {
    if actual == want {
        return true;
    }
    actual
        .rsplit_once(":id/")
        .map(|(_, bare)| bare == want)
        .unwrap_or(false)
}

fn text_matches(actual: Option<&str>, want: &str) -> bool {
    actual
        .map(|a| a.trim().eq_ignore_ascii_case(want.trim()))
        .unwrap_or(false)
}

/// One way of getting rid of a blocking overlay, tried in rank order.
#[derive(Debug, Clone, PartialEq)]
pub enum DismissStrategy {
    /// System back key.
    Back,
    /// Tap a button inside the overlay ("Not Now", "OK", ...).
    Tap(Selector),
    /// Drag a bottom sheet down.
    SwipeDown,
    /// Tap the upper quarter of the screen, outside a centered dialog.
    TapOutside,
    /// Tap a fixed point, usually the dimmed background.
    TapPoint { x: i32, y: i32 },
}

impl DismissStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Back => "back",
            Self::Tap(_) => "tap",
            Self::SwipeDown => "swipe_down",
            Self::TapOutside => "tap_outside",
            Self::TapPoint { .. } => "tap_point",
        }
    }
}

const STRATEGY_NAMES: &[&str] = &["back", "tap", "swipe_down", "tap_outside", "tap_point"];
const UNIT_STRATEGIES: &[&str] = &["back", "swipe_down", "tap_outside"];

impl<'de> Deserialize<'de> for DismissStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DismissStrategyVisitor)
    }
}

struct DismissStrategyVisitor;

#[derive(Deserialize)]
struct PointPayload {
    x: i32,
    y: i32,
}

impl<'de> Visitor<'de> for DismissStrategyVisitor {
    type Value = DismissStrategy;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a dismiss strategy (string for unit variants, or map with single key)")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match value {
            "back" => Ok(DismissStrategy::Back),
            "swipe_down" => Ok(DismissStrategy::SwipeDown),
            "tap_outside" => Ok(DismissStrategy::TapOutside),
            other => Err(de::Error::unknown_variant(other, UNIT_STRATEGIES)),
        }
    }

    fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let key: String = map
            .next_key()?
            .ok_or_else(|| de::Error::custom("expected dismiss strategy key"))?;

        let strategy = match key.as_str() {
            "back" => {
                let _: serde_yaml::Value = map.next_value()?;
                DismissStrategy::Back
            }
            "swipe_down" => {
                let _: serde_yaml::Value = map.next_value()?;
                DismissStrategy::SwipeDown
            }
            "tap_outside" => {
                let _: serde_yaml::Value = map.next_value()?;
                DismissStrategy::TapOutside
            }
            "tap" => {
                let selector: Selector = map.next_value()?;
                if selector.is_empty() {
                    return Err(de::Error::custom("tap strategy needs a non-empty selector"));
                }
                DismissStrategy::Tap(selector)
            }
            "tap_point" => {
                let p: PointPayload = map.next_value()?;
                DismissStrategy::TapPoint { x: p.x, y: p.y }
            }
            other => return Err(de::Error::unknown_variant(other, STRATEGY_NAMES)),
        };

        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Option<&str>, text: Option<&str>) -> ViewNode {
        ViewNode {
            resource_id: id.map(String::from),
            text: text.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_resource_id_bare_and_qualified() {
        let sel = Selector::resource_id("follow_list_username");
        assert!(sel.matches(&node(
            Some("com.example.app:id/follow_list_username"),
            None
        )));
        assert!(sel.matches(&node(Some("follow_list_username"), None)));
        assert!(!sel.matches(&node(Some("com.example.app:id/follow_list_container"), None)));
        assert!(!sel.matches(&node(None, Some("follow_list_username"))));
    }

    #[test]
    fn test_text_is_case_insensitive() {
        let sel = Selector::text("Not Now");
        assert!(sel.matches(&node(None, Some("  not now "))));
        assert!(!sel.matches(&node(None, Some("Not Now!"))));
    }

    #[test]
    fn test_empty_selector_matches_nothing() {
        assert!(!Selector::default().matches(&node(Some("x"), Some("y"))));
    }

    #[test]
    fn test_combined_fields_all_required() {
        let sel = Selector {
            resource_id: Some("button".into()),
            text: Some("OK".into()),
            ..Default::default()
        };
        assert!(sel.matches(&node(Some("app:id/button"), Some("ok"))));
        assert!(!sel.matches(&node(Some("app:id/button"), Some("Cancel"))));
    }

    #[test]
    fn test_to_locator_prefers_resource_id() {
        let sel = Selector {
            resource_id: Some("entry".into()),
            text: Some("Followers".into()),
            ..Default::default()
        };
        assert_eq!(sel.to_locator(), Some(Locator::ResourceId("entry".into())));
        assert_eq!(Selector::default().to_locator(), None);
    }

    #[test]
    fn test_parse_dismiss_strategies() {
        let yaml = r#"
- back
- swipe_down
- tap:
    text: "Not Now"
- tap_point:
    x: 540
    y: 120
- back: {}
- tap_outside
"#;
        let strategies: Vec<DismissStrategy> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(strategies.len(), 6);
        assert_eq!(strategies[0], DismissStrategy::Back);
        assert_eq!(strategies[1], DismissStrategy::SwipeDown);
        assert_eq!(strategies[2], DismissStrategy::Tap(Selector::text("Not Now")));
        assert_eq!(strategies[3], DismissStrategy::TapPoint { x: 540, y: 120 });
        assert_eq!(strategies[4], DismissStrategy::Back);
        assert_eq!(strategies[5], DismissStrategy::TapOutside);
    }

    #[test]
    fn test_parse_dismiss_rejects_unknown_and_empty_tap() {
        assert!(serde_yaml::from_str::<DismissStrategy>("reboot").is_err());
        assert!(serde_yaml::from_str::<DismissStrategy>("tap: {}").is_err());
    }
}
