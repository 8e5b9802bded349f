pub mod broadcast;
#[cfg(feature = "chrome")]
pub mod chrome;
pub mod config;
pub mod driver;
pub mod errors;
pub mod navigation;
pub mod parser;
pub mod poller;
pub mod session;
pub mod steps;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use broadcast::{EventBroadcaster, Subscription};
#[cfg(feature = "chrome")]
pub use chrome::ChromeDriver;
pub use config::BridgeConfig;
pub use driver::{AutomationDriver, Selector, WaitPolicy};
pub use errors::{BridgeError, DriverError, Result};
pub use session::SessionOrchestrator;
pub use steps::StepTable;
pub use types::*;
