#![doc = "Periodic multi-rate sequencer: timer, release tokens, services, and placement planning."]

pub mod hyperperiod;
pub mod planner;
pub mod realtime;
pub mod runtime;
pub mod sequencer;
pub mod service;
pub mod sink;
pub mod timer;
pub mod token;

pub use planner::{plan, SchedulePlan, ServicePlan, ThreadPlacement, UtilizationReport};
pub use realtime::*;
pub use runtime::*;
pub use sequencer::*;
pub use service::{ServiceContext, ServiceGroup, ServiceStats};
pub use sink::*;
pub use timer::*;
pub use token::*;
