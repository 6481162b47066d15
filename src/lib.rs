//! Event Notifier - 摄像头、门铃与局域网事件的规则化通知引擎

pub mod cli;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod edge;
pub mod engine;
pub mod error;
pub mod event;
pub mod exec;
pub mod notification;
pub mod nvr;
pub mod presence;
pub mod rules;
pub mod source;
pub mod vendor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use connectivity::{ConnectivityReconciler, DeviceControl, DeviceStatus, ExceptionState, Probe};
pub use edge::{DebouncedEdgeDetector, Edge};
pub use engine::Engine;
pub use error::{NotifyError, Result};
pub use event::{EventNormalizer, EventPhase, NormalizedEvent, SourceKind};
pub use notification::{
    DispatchOutcome, HysteresisTracker, ImageFetcher, ImageKind, Mailer, NotificationDispatcher,
    OutgoingMessage, SkipReason,
};
pub use nvr::NvrClient;
pub use presence::{LanSource, NewClientDetector, OuiMap, PresenceMonitor};
pub use rules::{is_quiet, match_rules, NotificationRule, QuietHours, RuleDefinition, RuleSet};
pub use source::{EventSource, RawEvent};
pub use vendor::{DoorbellDriver, VendorKind, VendorRegistry};
