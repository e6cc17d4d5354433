//! Declarative lookup tables: each UI field maps to an ordered list of
//! locator strategies, and one resolver takes the first that matches.

use crate::browser::BrowserPage;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "kebab-case")]
pub enum Locator {
    Css(String),
    /// First element matching `css` whose visible text contains `contains` (case-insensitive).
    Text { css: String, contains: String },
    /// Form control associated with a `<label>` containing the text.
    Label(String),
    Placeholder(String),
    AriaLabel(String),
}

impl Locator {
    pub fn css(selector: &str) -> Self {
        Locator::Css(selector.to_string())
    }

    pub fn text(css: &str, contains: &str) -> Self {
        Locator::Text {
            css: css.to_string(),
            contains: contains.to_string(),
        }
    }

    pub fn label(text: &str) -> Self {
        Locator::Label(text.to_string())
    }

    pub fn placeholder(text: &str) -> Self {
        Locator::Placeholder(text.to_string())
    }

    pub fn aria(text: &str) -> Self {
        Locator::AriaLabel(text.to_string())
    }
}

/// What to do with the element once a locator resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Probe,
    ReadText,
    Click,
    Fill(String),
    Check(bool),
    Select(String),
}

impl Action {
    fn to_args(&self) -> (Value, Value) {
        match self {
            Action::Probe => (json!("probe"), Value::Null),
            Action::ReadText => (json!("text"), Value::Null),
            Action::Click => (json!("click"), Value::Null),
            Action::Fill(v) => (json!("fill"), json!(v)),
            Action::Check(on) => (json!("check"), json!(on)),
            Action::Select(v) => (json!("select"), json!(v)),
        }
    }
}

pub(crate) const FIND_JS: &str = r#"
function __pwFind(loc) {
  const lc = (s) => (s || '').toLowerCase();
  const txt = (el) => lc(el.innerText || el.textContent);
  switch (loc.by) {
    case 'css':
      return document.querySelector(loc.value);
    case 'text':
      for (const el of document.querySelectorAll(loc.value.css)) {
        if (txt(el).includes(lc(loc.value.contains))) return el;
      }
      return null;
    case 'label':
      for (const l of document.querySelectorAll('label')) {
        if (!txt(l).includes(lc(loc.value))) continue;
        if (l.control) return l.control;
        const id = l.getAttribute('for');
        if (id) return document.getElementById(id);
      }
      return null;
    case 'placeholder':
      return document.querySelector('[placeholder*="' + CSS.escape(loc.value) + '" i]');
    case 'aria-label':
      return document.querySelector('[aria-label*="' + CSS.escape(loc.value) + '" i]');
  }
  return null;
}
"#;

const ACT_JS: &str = r#"
const el = __pwFind(arguments[0]);
if (!el) return null;
const arg = arguments[2];
switch (arguments[1]) {
  case 'probe':
    return true;
  case 'text':
    return (el.innerText || el.textContent || '').trim();
  case 'click':
    el.scrollIntoView({ block: 'center' });
    el.click();
    return true;
  case 'fill': {
    const proto = Object.getPrototypeOf(el);
    const setter = Object.getOwnPropertyDescriptor(proto, 'value');
    if (setter && setter.set) { setter.set.call(el, arg); } else { el.value = arg; }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
  }
  case 'check':
    if (!!el.checked !== arg) el.click();
    return true;
  case 'select': {
    const want = (arg || '').toLowerCase();
    for (const opt of el.options || []) {
      if ((opt.text || '').toLowerCase().includes(want) || opt.value.toLowerCase() === want) {
        el.value = opt.value;
        el.dispatchEvent(new Event('change', { bubbles: true }));
        return true;
      }
    }
    return null;
  }
}
return null;
"#;

/// First-match-wins over an ordered candidate list.
pub fn first_match<T>(
    candidates: &[Locator],
    mut probe: impl FnMut(&Locator) -> Option<T>,
) -> Option<(usize, T)> {
    candidates
        .iter()
        .enumerate()
        .find_map(|(i, loc)| probe(loc).map(|found| (i, found)))
}

/// Result of resolving a field against the live page.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub index: usize,
    pub locator: Locator,
    pub value: Value,
}

/// Tries each candidate in order, performing `action` on the first element found.
///
/// A candidate whose script errors (selector syntax, detached node) is skipped.
pub async fn resolve(
    page: &dyn BrowserPage,
    candidates: &[Locator],
    action: &Action,
) -> Result<Option<Resolved>> {
    let script = format!("{FIND_JS}\n{ACT_JS}");
    let (verb, arg) = action.to_args();
    for (index, locator) in candidates.iter().enumerate() {
        let loc = serde_json::to_value(locator)?;
        match page
            .evaluate(&script, vec![loc, verb.clone(), arg.clone()])
            .await
        {
            Ok(Value::Null) => continue,
            Ok(value) => {
                debug!(?locator, index, "Locator resolved");
                return Ok(Some(Resolved {
                    index,
                    locator: locator.clone(),
                    value,
                }));
            }
            Err(e) if e.is_transient() => {
                debug!(?locator, "Locator failed transiently: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Field name to ordered locator candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityTable {
    fields: Vec<(String, Vec<Locator>)>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, candidates: Vec<Locator>) -> Self {
        self.set(name, candidates);
        self
    }

    pub fn set(&mut self, name: &str, candidates: Vec<Locator>) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = candidates,
            None => self.fields.push((name.to_string(), candidates)),
        }
    }

    pub fn candidates(&self, name: &str) -> &[Locator] {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.as_slice())
            .unwrap_or(&[])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Entries from `overrides` replace same-named fields; new fields are appended.
    pub fn merged(mut self, overrides: &CapabilityTable) -> Self {
        for (name, candidates) in &overrides.fields {
            self.set(name, candidates.clone());
        }
        self
    }

    pub async fn resolve(
        &self,
        page: &dyn BrowserPage,
        field: &str,
        action: &Action,
    ) -> Result<Option<Resolved>> {
        resolve(page, self.candidates(field), action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::RecordingPage;

    #[test]
    fn test_first_match_prefers_earlier_candidate() {
        let candidates = vec![
            Locator::css("#missing"),
            Locator::css("#price-min"),
            Locator::label("Minimum price"),
        ];
        let present = ["#price-min", "Minimum price"];

        let hit = first_match(&candidates, |loc| match loc {
            Locator::Css(s) if present.contains(&s.as_str()) => Some(s.clone()),
            Locator::Label(s) if present.contains(&s.as_str()) => Some(s.clone()),
            _ => None,
        });

        assert_eq!(hit, Some((1, "#price-min".to_string())));
    }

    #[test]
    fn test_first_match_none() {
        let candidates = vec![Locator::css("#a"), Locator::css("#b")];
        assert_eq!(first_match(&candidates, |_| None::<()>), None);
    }

    #[test]
    fn test_locator_serializes_with_tag() {
        let value = serde_json::to_value(Locator::text("button", "Apply")).unwrap();
        assert_eq!(value["by"], "text");
        assert_eq!(value["value"]["contains"], "Apply");

        let parsed: Locator =
            serde_json::from_value(json!({ "by": "aria-label", "value": "Zoom in" })).unwrap();
        assert_eq!(parsed, Locator::aria("Zoom in"));
    }

    #[test]
    fn test_merged_overrides_and_appends() {
        let base = CapabilityTable::new()
            .field("search", vec![Locator::css("input.search")])
            .field("apply", vec![Locator::text("button", "Apply")]);
        let overrides = CapabilityTable::new()
            .field("search", vec![Locator::placeholder("City")])
            .field("reset", vec![Locator::text("button", "Reset")]);

        let merged = base.merged(&overrides);

        assert_eq!(merged.candidates("search"), &[Locator::placeholder("City")]);
        assert_eq!(merged.candidates("apply").len(), 1);
        assert_eq!(merged.names().collect::<Vec<_>>(), vec!["search", "apply", "reset"]);
        assert!(merged.candidates("unknown").is_empty());
    }

    #[tokio::test]
    async fn test_resolve_skips_null_candidates() {
        let page = RecordingPage::new("p");
        page.answers.lock().unwrap().extend([Value::Null, json!("Albany, NY")]);
        let candidates = vec![Locator::css("h1.location"), Locator::css(".search-title")];

        let resolved = resolve(&page, &candidates, &Action::ReadText)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resolved.index, 1);
        assert_eq!(resolved.value, json!("Albany, NY"));
    }
}
