pub mod agent;
pub mod auth;
pub mod browser;
pub mod capability;
pub mod error;
pub mod extract;
pub mod filters;
pub mod harvester;
pub mod page_site;
pub mod site;
pub mod walker;
pub mod webdriver;

pub use agent::{AgentSource, resolve_agent};
pub use auth::{Authenticator, FormAuthenticator};
pub use browser::{BrowserPage, BrowserSession, PageHandle, Point};
pub use capability::{CapabilityTable, Locator};
pub use error::ScanError;
pub use extract::{NormalizedListing, PriceRange, RawListingCard, Rejection};
pub use filters::{FilterApplier, FilterReport, FilterRules, TableFilterApplier};
pub use harvester::{HarvestOutcome, HarvesterConfig, ListHarvester};
pub use page_site::{PageSite, SiteProfile};
pub use site::{ClusterDescriptor, MapView, SiteDriver, VirtualList};
pub use walker::{ClusterWalker, ListReady, WalkOutcome, WalkPolicy, WalkReport, WalkerConfig};
pub use webdriver::{WebDriverOptions, WebDriverSession};
