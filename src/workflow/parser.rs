//! Workflow description ingestion: DAX XML and Pegasus JSON.
//!
//! Task runtimes in both formats are wall-clock seconds measured on a
//! reference machine; they are scaled to flops with `reference_flop_rate`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde_json::Value;

use super::Workflow;
use crate::utils::prelude::*;

/// Parse a DAX XML workflow description.
///
/// Recognized shape: `adag > job[id, name, runtime, numprocs] > uses[file,
/// size, link]` with `adag > child[ref] > parent[ref]` edges. The number of
/// processors attribute goes by several aliases in the wild.
pub fn from_dax(content: &str, reference_flop_rate: f64) -> Result<Workflow> {
    let doc = roxmltree::Document::parse(content)?;
    let adag = doc.root_element();
    if adag.tag_name().name() != "adag" {
        return Err(Error::workflow_input("DAX root element is not <adag>"));
    }

    let mut workflow = Workflow::new();

    for job in adag.children().filter(|n| n.has_tag_name("job")) {
        let id = job
            .attribute("id")
            .ok_or_else(|| Error::workflow_input("DAX job without id"))?;
        let runtime: f64 = job
            .attribute("runtime")
            .ok_or_else(|| Error::workflow_input(format!("DAX job {} without runtime", id)))?
            .parse()
            .map_err(|_| Error::workflow_input(format!("DAX job {} has invalid runtime", id)))?;
        let num_procs = ["numprocs", "num_procs", "numcores", "num_cores"]
            .iter()
            .find_map(|k| job.attribute(*k))
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|_| Error::workflow_input(format!("DAX job {} has invalid proc count", id)))?
            .unwrap_or(1)
            .max(1);

        // a DAX num_procs of x means the task can use up to x cores but
        // still runs on one
        let task = workflow.add_task(id, runtime * reference_flop_rate, 1, num_procs, 1.0, 0.0)?;

        for uses in job.children().filter(|n| n.has_tag_name("uses")) {
            let file_id = uses
                .attribute("file")
                .ok_or_else(|| Error::workflow_input(format!("DAX uses without file in job {}", id)))?;
            let size: f64 = uses.attribute("size").map(|s| s.parse()).transpose().ok().flatten().unwrap_or(0.0);
            let file = workflow.file_or_add(file_id, size);
            match uses.attribute("link") {
                Some("input") => task.borrow_mut().inputs.push(file),
                Some("output") => task.borrow_mut().outputs.push(file),
                other => {
                    warn!(job = id, file = file_id, link = ?other, "ignoring uses with unknown link");
                }
            }
        }
    }

    for child in adag.children().filter(|n| n.has_tag_name("child")) {
        let child_ref = child
            .attribute("ref")
            .ok_or_else(|| Error::workflow_input("DAX child without ref"))?;
        for parent in child.children().filter(|n| n.has_tag_name("parent")) {
            let parent_ref = parent
                .attribute("ref")
                .ok_or_else(|| Error::workflow_input("DAX parent without ref"))?;
            workflow.add_dependency(parent_ref, child_ref)?;
        }
    }

    Ok(workflow)
}

/// Parse a Pegasus JSON workflow description.
///
/// Transfer and auxiliary jobs are elided; their parent references are passed
/// through transitively so the compute-task DAG stays connected. Redundant
/// edges (already implied by existing paths) are skipped unless
/// `redundant_dependencies` is set.
pub fn from_pegasus_json(content: &str, reference_flop_rate: f64, redundant_dependencies: bool) -> Result<Workflow> {
    let root: Value = serde_json::from_str(content)?;
    let jobs = root
        .get("workflow")
        .and_then(|w| w.get("jobs"))
        .and_then(|j| j.as_array())
        .ok_or_else(|| Error::workflow_input("JSON workflow has no workflow.jobs array"))?;

    let mut workflow = Workflow::new();
    let mut elided: HashMap<String, Vec<String>> = HashMap::new();
    let mut parents_of: HashMap<String, Vec<String>> = HashMap::new();

    for job in jobs {
        let name = job
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::workflow_input("JSON job without name"))?
            .to_owned();
        let kind = job.get("type").and_then(|v| v.as_str()).unwrap_or("compute");
        let parents: Vec<String> = job
            .get("parents")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|p| p.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();

        match kind {
            "transfer" | "auxiliary" => {
                elided.insert(name, parents);
                continue;
            }
            "compute" => {}
            other => {
                return Err(Error::workflow_input(format!("JSON job {} has unknown type {}", name, other)));
            }
        }

        let runtime = job
            .get("runtime")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::workflow_input(format!("JSON job {} without runtime", name)))?;

        let task = workflow.add_task(&name, runtime * reference_flop_rate, 1, 1, 1.0, 0.0)?;
        if let Some(priority) = job.get("priority").and_then(|v| v.as_i64()) {
            task.borrow_mut().priority = priority;
        }

        if let Some(files) = job.get("files").and_then(|v| v.as_array()) {
            for f in files {
                let file_id = f
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::workflow_input(format!("JSON file without name in job {}", name)))?;
                let size = f.get("size").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let file = workflow.file_or_add(file_id, size);
                match f.get("link").and_then(|v| v.as_str()) {
                    Some("input") => task.borrow_mut().inputs.push(file),
                    Some("output") => task.borrow_mut().outputs.push(file),
                    other => {
                        warn!(job = %name, file = file_id, link = ?other, "ignoring file with unknown link");
                    }
                }
            }
        }

        parents_of.insert(name, parents);
    }

    // resolve parents through elided jobs, transitively
    for (child, parents) in &parents_of {
        let mut resolved: Vec<String> = vec![];
        let mut stack: Vec<String> = parents.clone();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(p) = stack.pop() {
            if !seen.insert(p.clone()) {
                continue;
            }
            if let Some(grand) = elided.get(&p) {
                stack.extend(grand.iter().cloned());
            } else if workflow.task(&p).is_some() {
                resolved.push(p);
            } else {
                warn!(job = %child, parent = %p, "dropping reference to unknown parent");
            }
        }
        resolved.sort();
        for p in resolved {
            if !redundant_dependencies && workflow.is_reachable(&p, child) {
                continue;
            }
            workflow.add_dependency(&p, child)?;
        }
    }

    Ok(workflow)
}

pub fn from_dax_file(path: impl AsRef<Path>, reference_flop_rate: f64) -> Result<Workflow> {
    let content = fs::read_to_string(path)?;
    from_dax(&content, reference_flop_rate)
}

pub fn from_pegasus_json_file(
    path: impl AsRef<Path>,
    reference_flop_rate: f64,
    redundant_dependencies: bool,
) -> Result<Workflow> {
    let content = fs::read_to_string(path)?;
    from_pegasus_json(&content, reference_flop_rate, redundant_dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<adag>
  <job id="t1" name="preprocess" runtime="10" numprocs="2">
    <uses file="in.dat" size="1000" link="input"/>
    <uses file="mid.dat" size="500" link="output"/>
  </job>
  <job id="t2" name="analyze" runtime="20">
    <uses file="mid.dat" size="500" link="input"/>
    <uses file="out.dat" size="100" link="output"/>
  </job>
  <child ref="t2">
    <parent ref="t1"/>
  </child>
</adag>"#;

    #[test]
    fn dax_basic() {
        let w = from_dax(DAX, 1e9).unwrap();
        assert_eq!(w.num_tasks(), 2);
        assert_eq!(w.num_files(), 3);

        let t1 = w.task("t1").unwrap();
        assert_eq!(t1.borrow().flops, 10.0 * 1e9);
        assert_eq!(t1.borrow().min_cores, 1);
        assert_eq!(t1.borrow().max_cores, 2);

        let t2 = w.task("t2").unwrap();
        assert_eq!(t2.borrow().parents, vec!["t1"]);

        let ready: Vec<_> = w.ready_tasks().iter().map(|t| t.borrow().id.clone()).collect();
        assert_eq!(ready, vec!["t1"]);
    }

    const PEGASUS: &str = r#"{
  "workflow": {
    "jobs": [
      {"name": "gen", "type": "compute", "runtime": 5.0,
       "files": [{"name": "a.dat", "size": 10, "link": "output"}], "parents": []},
      {"name": "stage", "type": "transfer", "runtime": 1.0, "parents": ["gen"]},
      {"name": "use", "type": "compute", "runtime": 2.5, "priority": 3,
       "files": [{"name": "a.dat", "size": 10, "link": "input"}], "parents": ["stage"]}
    ]
  }
}"#;

    #[test]
    fn pegasus_elides_transfer_jobs() {
        let w = from_pegasus_json(PEGASUS, 2e9, false).unwrap();
        assert_eq!(w.num_tasks(), 2);

        // the transfer job is gone but its parent link survives transitively
        let use_task = w.task("use").unwrap();
        assert_eq!(use_task.borrow().parents, vec!["gen"]);
        assert_eq!(use_task.borrow().priority, 3);
        assert_eq!(use_task.borrow().flops, 2.5 * 2e9);
    }

    #[test]
    fn pegasus_rejects_unknown_type() {
        let bad = r#"{"workflow": {"jobs": [{"name": "x", "type": "mystery", "runtime": 1.0}]}}"#;
        assert!(from_pegasus_json(bad, 1e9, false).is_err());
    }
}
