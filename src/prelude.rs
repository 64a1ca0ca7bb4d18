//! A list of everything needed to build a load test.

pub use crate::client::{HttpSession, RequestError};
pub use crate::config::ForgeConfiguration;
pub use crate::metrics::{MetricSnapshot, TestResult};
pub use crate::pattern::LoadPattern;
pub use crate::scenario::{ScenarioDescriptor, ScenarioTask, TaskResult};
pub use crate::{scenario_task, ForgeError, LoadTest};
