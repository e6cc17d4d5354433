use crate::extract::{
    AgentInfo, RawListingCard, agent_from_card, agent_from_contact_scan, agent_from_detail_text,
};
use crate::site::SiteDriver;
use tracing::debug;

/// Which stage of the fallback chain produced the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSource {
    Card,
    DetailView,
    ContactScan,
    None,
}

/// Resolves the listing agent for a card, trying each stage only if the
/// previous one produced nothing. Failures are never fatal: the listing is
/// saved with empty agent fields instead.
pub async fn resolve_agent<S: SiteDriver + ?Sized>(
    site: &S,
    card: &RawListingCard,
    open_details: bool,
) -> (AgentInfo, AgentSource) {
    if let Some(agent) = agent_from_card(&card.agent) {
        return (agent, AgentSource::Card);
    }

    if open_details {
        match site.detail_text(card).await {
            Ok(Some(text)) => {
                if let Some(agent) = agent_from_detail_text(&text) {
                    return (agent, AgentSource::DetailView);
                }
            }
            Ok(None) => {}
            Err(e) => debug!(card = %card.key(), "Detail view unavailable: {}", e),
        }
    }

    match site.contact_text(card).await {
        Ok(Some(text)) => {
            if let Some(agent) = agent_from_contact_scan(&text) {
                return (agent, AgentSource::ContactScan);
            }
        }
        Ok(None) => {}
        Err(e) => debug!(card = %card.key(), "Contact scan failed: {}", e),
    }

    (AgentInfo::default(), AgentSource::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Point;
    use crate::error::{Result, ScanError};
    use crate::extract::AgentHints;
    use crate::site::{ClusterDescriptor, MapView, ScrollMetrics, VirtualList};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Reply {
        Text(&'static str),
        Nothing,
        Fail,
    }

    impl Reply {
        fn into_result(self, stage: &str) -> Result<Option<String>> {
            match self {
                Reply::Text(text) => Ok(Some(text.to_string())),
                Reply::Nothing => Ok(None),
                Reply::Fail => Err(ScanError::ElementNotFound(format!("{stage} panel"))),
            }
        }
    }

    struct ScriptedSite {
        detail: Reply,
        contact: Reply,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedSite {
        fn new(detail: Reply, contact: Reply) -> Self {
            Self {
                detail,
                contact,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MapView for ScriptedSite {
        async fn list_present(&self) -> Result<bool> {
            Ok(true)
        }
        async fn clusters(&self) -> Result<Vec<ClusterDescriptor>> {
            Ok(vec![])
        }
        async fn zoom_level(&self) -> Result<Option<f64>> {
            Ok(None)
        }
        async fn can_zoom_in(&self) -> Result<bool> {
            Ok(false)
        }
        async fn zoom_in(&self) -> Result<()> {
            Ok(())
        }
        async fn zoom_to(&self, _level: f64) -> Result<()> {
            Ok(())
        }
        async fn pointer_move(&self, _at: Point) -> Result<()> {
            Ok(())
        }
        async fn click(&self, _at: Point) -> Result<()> {
            Ok(())
        }
        async fn neutral_click(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl VirtualList for ScriptedSite {
        async fn mounted_rows(&self) -> Result<Vec<RawListingCard>> {
            Ok(vec![])
        }
        async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
            Ok(ScrollMetrics::default())
        }
        async fn scroll_to(&self, _offset: f64) -> Result<()> {
            Ok(())
        }
        async fn nudge_page(&self, _delta: f64) -> Result<()> {
            Ok(())
        }
        async fn reported_count(&self) -> Result<Option<usize>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl SiteDriver for ScriptedSite {
        async fn map_imagery_missing(&self) -> Result<bool> {
            Ok(false)
        }
        async fn search_by_input(&self, _query: &str) -> Result<bool> {
            Ok(true)
        }
        async fn navigate(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn displayed_location(&self) -> Result<Option<String>> {
            Ok(None)
        }
        async fn hard_reload(&self) -> Result<()> {
            Ok(())
        }
        async fn detail_text(&self, _card: &RawListingCard) -> Result<Option<String>> {
            self.calls.lock().unwrap().push("detail");
            self.detail.into_result("detail")
        }
        async fn contact_text(&self, _card: &RawListingCard) -> Result<Option<String>> {
            self.calls.lock().unwrap().push("contact");
            self.contact.into_result("contact")
        }
    }

    const DETAIL: &str = "Buyer's agent: Bob Smith 212-555-0199\n\
                          Listing Agent: Jane Doe\n(518) 555-0101\njane@realty.com";
    const CONTACT: &str = "tel:5185550177 mailto:office@realty.com";

    fn card(hints: AgentHints) -> RawListingCard {
        RawListingCard {
            address_lines: vec!["12 Elm St".to_string(), "Albany, NY 12203".to_string()],
            price_text: Some("$250,000".to_string()),
            agent: hints,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_card_hints_skip_every_page_lookup() {
        let site = ScriptedSite::new(Reply::Text(DETAIL), Reply::Text(CONTACT));
        let card = card(AgentHints {
            name: Some("Sam Card".to_string()),
            phone: Some("518-555-0123".to_string()),
            ..Default::default()
        });

        let (agent, source) = resolve_agent(&site, &card, true).await;

        assert_eq!(source, AgentSource::Card);
        assert_eq!(agent.name.as_deref(), Some("Sam Card"));
        assert!(site.calls().is_empty());
    }

    #[tokio::test]
    async fn test_detail_view_used_before_contact_scan() {
        let site = ScriptedSite::new(Reply::Text(DETAIL), Reply::Text(CONTACT));

        let (agent, source) = resolve_agent(&site, &card(AgentHints::default()), true).await;

        assert_eq!(source, AgentSource::DetailView);
        assert_eq!(agent.name.as_deref(), Some("Jane Doe"));
        assert_eq!(agent.phone.as_deref(), Some("518-555-0101"));
        assert_eq!(site.calls(), vec!["detail"]);
    }

    #[tokio::test]
    async fn test_details_disabled_goes_straight_to_contact_scan() {
        let site = ScriptedSite::new(Reply::Text(DETAIL), Reply::Text(CONTACT));

        let (agent, source) = resolve_agent(&site, &card(AgentHints::default()), false).await;

        assert_eq!(source, AgentSource::ContactScan);
        assert_eq!(agent.phone.as_deref(), Some("518-555-0177"));
        assert_eq!(site.calls(), vec!["contact"]);
    }

    #[tokio::test]
    async fn test_contact_scan_after_empty_detail_view() {
        let site = ScriptedSite::new(
            Reply::Text("3 bds, 2 ba. Open house Sunday."),
            Reply::Text(CONTACT),
        );

        let (agent, source) = resolve_agent(&site, &card(AgentHints::default()), true).await;

        assert_eq!(source, AgentSource::ContactScan);
        assert_eq!(agent.email.as_deref(), Some("office@realty.com"));
        assert_eq!(site.calls(), vec!["detail", "contact"]);
    }

    #[tokio::test]
    async fn test_detail_failure_falls_through_to_contact_scan() {
        let site = ScriptedSite::new(Reply::Fail, Reply::Text(CONTACT));

        let (_, source) = resolve_agent(&site, &card(AgentHints::default()), true).await;

        assert_eq!(source, AgentSource::ContactScan);
        assert_eq!(site.calls(), vec!["detail", "contact"]);
    }

    #[tokio::test]
    async fn test_failures_leave_agent_empty() {
        let site = ScriptedSite::new(Reply::Fail, Reply::Fail);

        let (agent, source) = resolve_agent(&site, &card(AgentHints::default()), true).await;

        assert_eq!(source, AgentSource::None);
        assert_eq!(agent, AgentInfo::default());

        let site = ScriptedSite::new(Reply::Nothing, Reply::Nothing);
        let (agent, source) = resolve_agent(&site, &card(AgentHints::default()), true).await;
        assert_eq!(source, AgentSource::None);
        assert!(agent.is_empty());
    }
}
