//! Scenario descriptors consumed by the load engine.
//!
//! A [`ScenarioDescriptor`] is the fully-resolved, immutable description of
//! what each virtual user does: a weighted set of async tasks, optional
//! setup/teardown hooks, default headers, and a think-time range. How the
//! descriptor is authored (DSL, registry, file loader) is a concern of the
//! caller; the engine only consumes the resolved structure.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rand::Rng;
use url::Url;

use crate::client::{HttpSession, RequestError};
use crate::ForgeError;

/// The result of one scenario task iteration.
pub type TaskResult = Result<(), RequestError>;

/// The future returned by a scenario task. Not `Send`: tasks run on their
/// worker's single-threaded cooperative scheduler.
pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = TaskResult> + 'a>>;

/// An async callable taking the worker's HTTP client capability. The function
/// itself crosses thread boundaries into workers, so it must be `Send + Sync`;
/// the futures it produces never leave the worker thread.
pub type TaskFunction = Arc<dyn for<'a> Fn(&'a HttpSession) -> TaskFuture<'a> + Send + Sync>;

/// Shorthand for wrapping an async function into a [`ScenarioTask`].
///
/// # Example
/// ```rust,no_run
/// use loadforge::prelude::*;
///
/// async fn browse_index(session: &HttpSession) -> TaskResult {
///     let _response = session.get("/", "index").await?;
///     Ok(())
/// }
///
/// let task = scenario_task!(browse_index).set_weight(10);
/// ```
#[macro_export]
macro_rules! scenario_task {
    ($task_func:ident) => {
        $crate::scenario::ScenarioTask::new(
            stringify!($task_func),
            ::std::sync::Arc::new(move |session| ::std::boxed::Box::pin($task_func(session))),
        )
    };
}

/// One weighted task within a scenario.
#[derive(Clone)]
pub struct ScenarioTask {
    /// Logical name, used as the default endpoint label in metrics.
    pub name: String,
    /// Relative selection weight. Weight-zero tasks are never selected.
    pub weight: usize,
    pub function: TaskFunction,
}

impl ScenarioTask {
    pub fn new(name: &str, function: TaskFunction) -> ScenarioTask {
        trace!("new task: name: {}", name);
        ScenarioTask {
            name: name.to_string(),
            weight: 1,
            function,
        }
    }

    pub fn set_weight(mut self, weight: usize) -> Self {
        trace!("{} set_weight: {}", self.name, weight);
        self.weight = weight;
        self
    }
}

impl std::fmt::Debug for ScenarioTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioTask")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Complete definition of a load test scenario.
#[derive(Clone)]
pub struct ScenarioDescriptor {
    pub name: String,
    /// Base URL prepended to all relative request paths.
    pub base_url: String,
    /// Headers applied to every request. Setup hooks commonly add
    /// authentication tokens here before the task loop starts.
    pub default_headers: BTreeMap<String, String>,
    pub tasks: Vec<ScenarioTask>,
    /// Run once per virtual user before its task loop.
    pub setup: Option<TaskFunction>,
    /// Run once per virtual user on shutdown; failures never abort shutdown.
    pub teardown: Option<TaskFunction>,
    /// Random pause range `(min, max)` in seconds between task iterations.
    pub think_time: (f64, f64),
}

impl ScenarioDescriptor {
    pub fn new(name: &str, base_url: &str) -> ScenarioDescriptor {
        trace!("new scenario: name: {}", name);
        ScenarioDescriptor {
            name: name.to_string(),
            base_url: base_url.to_string(),
            default_headers: BTreeMap::new(),
            tasks: Vec::new(),
            setup: None,
            teardown: None,
            think_time: (0.5, 1.5),
        }
    }

    pub fn register_task(mut self, task: ScenarioTask) -> Self {
        trace!("{} register_task: {}", self.name, task.name);
        self.tasks.push(task);
        self
    }

    pub fn set_default_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn set_setup(mut self, function: TaskFunction) -> Self {
        self.setup = Some(function);
        self
    }

    pub fn set_teardown(mut self, function: TaskFunction) -> Self {
        self.teardown = Some(function);
        self
    }

    pub fn set_think_time(mut self, min: f64, max: f64) -> Self {
        self.think_time = (min, max);
        self
    }

    /// Confirm the scenario can actually drive load.
    pub fn validate(&self) -> Result<(), ForgeError> {
        if Url::parse(&self.base_url).is_err() {
            return Err(ForgeError::InvalidOption {
                option: "base_url".to_string(),
                value: self.base_url.clone(),
                detail: "scenario base_url must be a valid URL".to_string(),
            });
        }
        if !self.tasks.iter().any(|task| task.weight > 0) {
            return Err(ForgeError::InvalidScenario {
                scenario: self.name.clone(),
                detail: "at least one task with a positive weight is required".to_string(),
            });
        }
        let (min, max) = self.think_time;
        if min < 0.0 || max < min {
            return Err(ForgeError::InvalidOption {
                option: "think_time".to_string(),
                value: format!("({}, {})", min, max),
                detail: "think_time requires 0 <= min <= max".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ScenarioDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioDescriptor")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("tasks", &self.tasks)
            .field("think_time", &self.think_time)
            .finish()
    }
}

/// Weighted task selection by inverse-CDF sampling over a precomputed
/// cumulative weight array. Weight-zero tasks are excluded.
#[derive(Debug, Clone)]
pub(crate) struct WeightedChoice {
    /// Cumulative weights of the selectable tasks, strictly increasing.
    cumulative: Vec<u64>,
    /// Maps a cumulative position back to the task's index in the scenario.
    task_indices: Vec<usize>,
    total: u64,
}

impl WeightedChoice {
    pub(crate) fn new(tasks: &[ScenarioTask]) -> Result<WeightedChoice, ForgeError> {
        let mut cumulative = Vec::new();
        let mut task_indices = Vec::new();
        let mut total: u64 = 0;
        for (index, task) in tasks.iter().enumerate() {
            if task.weight == 0 {
                debug!("excluding weight-zero task: {}", task.name);
                continue;
            }
            total += task.weight as u64;
            cumulative.push(total);
            task_indices.push(index);
        }
        if total == 0 {
            return Err(ForgeError::InvalidScenario {
                scenario: String::new(),
                detail: "no tasks with positive weight".to_string(),
            });
        }
        Ok(WeightedChoice {
            cumulative,
            task_indices,
            total,
        })
    }

    /// Pick a task index, distributed proportionally to task weights.
    pub(crate) fn pick<R: Rng>(&self, rng: &mut R) -> usize {
        let point = rng.gen_range(0..self.total);
        let position = self.cumulative.partition_point(|&bound| bound <= point);
        self.task_indices[position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_session: &HttpSession) -> TaskResult {
        Ok(())
    }

    fn noop_task(name: &str, weight: usize) -> ScenarioTask {
        ScenarioTask::new(name, Arc::new(move |session| Box::pin(noop(session)))).set_weight(weight)
    }

    #[test]
    fn weighted_selection_follows_weights() {
        let tasks = vec![noop_task("often", 10), noop_task("rarely", 2)];
        let choice = WeightedChoice::new(&tasks).unwrap();
        let mut rng = rand::thread_rng();
        let mut counts = [0usize; 2];
        for _ in 0..12_000 {
            counts[choice.pick(&mut rng)] += 1;
        }
        // 10:2 weighting, allow generous statistical slack.
        let ratio = counts[0] as f64 / counts[1] as f64;
        assert!(ratio > 3.5 && ratio < 7.0, "unexpected ratio {}", ratio);
    }

    #[test]
    fn zero_weight_tasks_excluded() {
        let tasks = vec![noop_task("never", 0), noop_task("always", 1)];
        let choice = WeightedChoice::new(&tasks).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..1_000 {
            assert_eq!(choice.pick(&mut rng), 1);
        }
    }

    #[test]
    fn all_zero_weights_rejected() {
        let tasks = vec![noop_task("never", 0)];
        assert!(WeightedChoice::new(&tasks).is_err());
    }

    #[test]
    fn scenario_validation() {
        let scenario = ScenarioDescriptor::new("empty", "http://127.0.0.1");
        assert!(scenario.validate().is_err());

        let scenario = ScenarioDescriptor::new("bad-url", "not a url")
            .register_task(noop_task("task", 1));
        assert!(scenario.validate().is_err());

        let scenario = ScenarioDescriptor::new("ok", "http://127.0.0.1")
            .register_task(noop_task("task", 1))
            .set_think_time(0.0, 0.0);
        assert!(scenario.validate().is_ok());

        let scenario = ScenarioDescriptor::new("bad-think", "http://127.0.0.1")
            .register_task(noop_task("task", 1))
            .set_think_time(2.0, 1.0);
        assert!(scenario.validate().is_err());
    }
}
