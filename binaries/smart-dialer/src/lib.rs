//! Smart Dialer: races candidate circumvention strategies against test domains and returns a
//! stream dialer backed by the first one observed to work end to end (see the module docs on
//! [`orchestrator`] for the happy path).

pub use cache::{SqliteResultCache, StrategyResultCache, WinningConfig, WINNING_STRATEGY_KEY};
pub use cancel::CancelToken;
pub use config::{parse_config, DnsEntry, FallbackEntry, StrategyConfig};
pub use error::{Result, SmartDialerError};
pub use fallback::FallbackDialerFactory;
pub use host_dialer::HostDialer;
pub use logging::init_logging;
pub use orchestrator::{canonicalize_domain, new_dialer};

mod addrcheck;
mod cache;
mod cancel;
mod config;
mod dns_wire;
mod error;
mod fallback;
mod host_dialer;
mod logging;
mod obfs;
mod orchestrator;
mod prober;
#[cfg(feature = "psiphon")]
mod psiphon_ffi;
mod race;
mod resolver;
mod tls_search;
