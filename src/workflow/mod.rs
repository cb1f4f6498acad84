use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use parse_display::Display;

use crate::types::Time;
use crate::utils::prelude::*;

pub mod parser;

pub type TaskRef = Rc<RefCell<WorkflowTask>>;
pub type FileRef = Rc<WorkflowFile>;

/// An immutable file descriptor; physical presence is tracked by storage services.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowFile {
    pub id: String,
    /// size in bytes
    pub size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "UPPERCASE")]
pub enum TaskState {
    Ready,
    Pending,
    Running,
    Completed,
    Failed,
}

/// A unit of computation in a workflow.
///
/// Compute cost is expressed in floating-point operations; the parallel
/// efficiency is a non-increasing function of cores, declared as a constant
/// factor applied beyond one core.
#[derive(Debug)]
pub struct WorkflowTask {
    pub id: String,
    pub flops: f64,
    pub min_cores: u64,
    pub max_cores: u64,
    pub parallel_efficiency: f64,
    /// required ram in bytes, per run
    pub ram: f64,
    pub priority: i64,
    pub state: TaskState,
    pub failure_count: u64,
    pub inputs: Vec<FileRef>,
    pub outputs: Vec<FileRef>,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub start_date: Option<Time>,
    pub end_date: Option<Time>,
}

impl WorkflowTask {
    pub fn efficiency(&self, cores: u64) -> f64 {
        if cores <= 1 {
            1.0
        } else {
            self.parallel_efficiency
        }
    }
}

/// The task/file graph a workflow manager executes.
///
/// Tasks are shared as `Rc<RefCell<_>>` within the single-threaded
/// simulation; the workflow itself stays with the workflow manager.
#[derive(Debug, Default)]
pub struct Workflow {
    tasks: Vec<TaskRef>,
    index: HashMap<String, usize>,
    files: HashMap<String, FileRef>,
}

impl Workflow {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_task(
        &mut self,
        id: impl Into<String>,
        flops: f64,
        min_cores: u64,
        max_cores: u64,
        parallel_efficiency: f64,
        ram: f64,
    ) -> Result<TaskRef> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(Error::workflow_input(format!("duplicate task id {}", id)));
        }
        let task = Rc::new(RefCell::new(WorkflowTask {
            id: id.clone(),
            flops,
            min_cores,
            max_cores: max_cores.max(min_cores),
            parallel_efficiency,
            ram,
            priority: 0,
            state: TaskState::Ready,
            failure_count: 0,
            inputs: vec![],
            outputs: vec![],
            parents: vec![],
            children: vec![],
            start_date: None,
            end_date: None,
        }));
        self.index.insert(id, self.tasks.len());
        self.tasks.push(task.clone());
        Ok(task)
    }

    pub fn add_file(&mut self, id: impl Into<String>, size: f64) -> Result<FileRef> {
        let id = id.into();
        if self.files.contains_key(&id) {
            return Err(Error::workflow_input(format!("duplicate file id {}", id)));
        }
        let file = Rc::new(WorkflowFile { id: id.clone(), size });
        self.files.insert(id, file.clone());
        Ok(file)
    }

    /// Fetch a file by id, creating it on first sight (parser convenience).
    pub fn file_or_add(&mut self, id: &str, size: f64) -> FileRef {
        if let Some(f) = self.files.get(id) {
            return f.clone();
        }
        let file = Rc::new(WorkflowFile { id: id.to_owned(), size });
        self.files.insert(id.to_owned(), file.clone());
        file
    }

    pub fn file(&self, id: &str) -> Option<FileRef> {
        self.files.get(id).cloned()
    }

    pub fn task(&self, id: &str) -> Option<TaskRef> {
        self.index.get(id).map(|&i| self.tasks[i].clone())
    }

    pub fn add_dependency(&mut self, parent: &str, child: &str) -> Result<()> {
        let p = self
            .task(parent)
            .ok_or_else(|| Error::workflow_input(format!("unknown parent task {}", parent)))?;
        let c = self
            .task(child)
            .ok_or_else(|| Error::workflow_input(format!("unknown child task {}", child)))?;
        if p.borrow().children.iter().any(|x| x == child) {
            return Ok(());
        }
        p.borrow_mut().children.push(child.to_owned());
        c.borrow_mut().parents.push(parent.to_owned());
        Ok(())
    }

    /// Is `to` already reachable from `from` through existing edges?
    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_owned()];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(t) = self.task(&id) {
                stack.extend(t.borrow().children.iter().cloned());
            }
        }
        false
    }

    /// Tasks whose predecessors have all completed and that are in state READY.
    pub fn ready_tasks(&self) -> Vec<TaskRef> {
        self.tasks
            .iter()
            .filter(|t| {
                let t = t.borrow();
                t.state == TaskState::Ready
                    && t.parents.iter().all(|p| {
                        self.task(p)
                            .map(|p| p.borrow().state == TaskState::Completed)
                            .unwrap_or(true)
                    })
            })
            .cloned()
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(|t| t.borrow().state == TaskState::Completed)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.iter()
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Files consumed by the workflow but produced by no task: these must be
    /// staged onto storage before execution starts.
    pub fn input_files(&self) -> Vec<FileRef> {
        let produced: std::collections::HashSet<String> = self
            .tasks
            .iter()
            .flat_map(|t| t.borrow().outputs.iter().map(|f| f.id.clone()).collect::<Vec<_>>())
            .collect();
        let mut inputs: Vec<FileRef> = self
            .tasks
            .iter()
            .flat_map(|t| t.borrow().inputs.clone())
            .filter(|f| !produced.contains(&f.id))
            .collect();
        inputs.sort_by(|a, b| a.id.cmp(&b.id));
        inputs.dedup_by(|a, b| a.id == b.id);
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Workflow {
        let mut w = Workflow::new();
        for id in ["a", "b", "c", "d"] {
            w.add_task(id, 1e9, 1, 1, 1.0, 0.0).unwrap();
        }
        w.add_dependency("a", "b").unwrap();
        w.add_dependency("a", "c").unwrap();
        w.add_dependency("b", "d").unwrap();
        w.add_dependency("c", "d").unwrap();
        w
    }

    #[test]
    fn ready_tracks_dependencies() {
        let w = diamond();
        let ready: Vec<_> = w.ready_tasks().iter().map(|t| t.borrow().id.clone()).collect();
        assert_eq!(ready, vec!["a"]);

        w.task("a").unwrap().borrow_mut().state = TaskState::Completed;
        let ready: Vec<_> = w.ready_tasks().iter().map(|t| t.borrow().id.clone()).collect();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn reachability() {
        let w = diamond();
        assert!(w.is_reachable("a", "d"));
        assert!(!w.is_reachable("d", "a"));
        assert!(!w.is_reachable("b", "c"));
    }

    #[test]
    fn duplicate_task_rejected() {
        let mut w = Workflow::new();
        w.add_task("t", 1.0, 1, 1, 1.0, 0.0).unwrap();
        assert!(w.add_task("t", 1.0, 1, 1, 1.0, 0.0).is_err());
    }
}
