//! How to parse and represent jobs.
//!
//! A jobs file is a YAML list of `JobSpec`s. Each spec expands into one
//! `JobDescriptor` per combination of its `params` (cartesian product), with
//! every templated field filled in through Handlebars.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Deserialize;

use crate::connection::expand_home;
use crate::error::SimrunError;
use crate::host::Host;
use crate::script::SchedulerKind;

/// Name of the generated job script inside the job directory.
pub const SCRIPT_NAME: &str = ".job_file";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    /// Local job directory (template).
    pub directory: String,
    /// Calculation prefix; also the job name (template).
    pub prefix: String,
    /// Main command line (template).
    pub command: String,
    #[serde(default = "default_input")]
    pub input: String,
    #[serde(default = "default_output")]
    pub output: String,
    /// Auxiliary files the input refers to, e.g. pseudopotentials.
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub asset_dir: Option<PathBuf>,
    /// Parameter values. Each key multiplies the number of jobs.
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
}

fn default_input() -> String {
    "{{prefix}}.pwi".to_string()
}

fn default_output() -> String {
    "{{prefix}}.pwo".to_string()
}

/// One unit of remote work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub name: String,
    pub local_dir: PathBuf,
    /// Set by the coordinator once the machine is known.
    pub remote_dir: Option<String>,
    pub input_file: String,
    pub output_file: String,
    pub command: String,
    pub scheduler: SchedulerKind,
    pub script_name: String,
    pub submit_command: Option<String>,
    /// Assigned by a queue scheduler on submission.
    pub job_id: Option<String>,
    pub assets: Vec<String>,
    pub asset_dir: Option<PathBuf>,
}

impl JobDescriptor {
    pub fn new(name: &str, local_dir: impl Into<PathBuf>, command: &str) -> Self {
        Self {
            name: name.to_string(),
            local_dir: local_dir.into(),
            remote_dir: None,
            input_file: format!("{}.pwi", name),
            output_file: format!("{}.pwo", name),
            command: command.to_string(),
            scheduler: SchedulerKind::default(),
            script_name: SCRIPT_NAME.to_string(),
            submit_command: None,
            job_id: None,
            assets: vec![],
            asset_dir: None,
        }
    }

    pub fn input_path(&self) -> PathBuf {
        self.local_dir.join(&self.input_file)
    }

    pub fn output_path(&self) -> PathBuf {
        self.local_dir.join(&self.output_file)
    }

    pub fn script_path(&self) -> PathBuf {
        self.local_dir.join(&self.script_name)
    }
}

/// Handlebars registry for filling in job templates. Values are inserted
/// verbatim, and referencing an unknown parameter is an error.
pub fn template_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry.set_strict_mode(true);
    handlebars_misc_helpers::register(&mut registry);
    registry
}

fn render(
    registry: &mut Handlebars,
    template: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, SimrunError> {
    if !registry.has_template(template) {
        registry
            .register_template_string(template, template)
            .map_err(|e| SimrunError::Config(format!("invalid template '{}': {}", template, e)))?;
    }
    registry.render(template, params).map_err(|e| {
        SimrunError::Config(format!(
            "failed to render '{}' with params {:?}: {}",
            template, params, e
        ))
    })
}

impl JobSpec {
    /// Every combination of parameter values, in key order.
    fn combinations(&self) -> Vec<BTreeMap<String, String>> {
        let mut expanded = vec![BTreeMap::new()];
        for (key, values) in &self.params {
            let mut part_expanded = Vec::with_capacity(expanded.len() * values.len());
            for params in expanded {
                for value in values {
                    let mut params = params.clone();
                    params.insert(key.clone(), value.clone());
                    part_expanded.push(params);
                }
            }
            expanded = part_expanded;
        }
        expanded
    }

    pub fn expand(
        &self,
        registry: &mut Handlebars,
        host: &Host,
        scheduler: SchedulerKind,
    ) -> Result<Vec<JobDescriptor>, SimrunError> {
        let mut jobs = Vec::new();
        for mut params in self.combinations() {
            params.insert("hostname".to_string(), host.hostname.clone());
            params.insert("username".to_string(), host.username.clone());

            let prefix = render(registry, &self.prefix, &params)?;
            params.insert("prefix".to_string(), prefix.clone());
            let input = render(registry, &self.input, &params)?;
            params.insert("input".to_string(), input.clone());
            let output = render(registry, &self.output, &params)?;
            params.insert("output".to_string(), output.clone());
            let directory = render(registry, &self.directory, &params)?;
            let command = render(registry, &self.command, &params)?;

            jobs.push(JobDescriptor {
                name: prefix,
                local_dir: expand_home(Path::new(&directory)),
                remote_dir: None,
                input_file: input,
                output_file: output,
                command,
                scheduler,
                script_name: SCRIPT_NAME.to_string(),
                submit_command: None,
                job_id: None,
                assets: self.assets.clone(),
                asset_dir: self.asset_dir.as_deref().map(expand_home),
            });
        }
        Ok(jobs)
    }
}

/// Reads a jobs file.
pub fn load_jobs(path: &str) -> Result<Vec<JobSpec>, SimrunError> {
    let file = File::open(path)?;
    Ok(serde_yaml::from_reader(file)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn spec(yaml: &str) -> JobSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_fill_input_and_output_from_prefix() {
        let spec = spec("directory: runs/si\nprefix: si\ncommand: pw.x -in {{input}} > {{output}}\n");
        let jobs = spec
            .expand(&mut template_registry(), &Host::new("hpc", "alice"), SchedulerKind::Slurm)
            .unwrap();

        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.name, "si");
        assert_eq!(job.local_dir, PathBuf::from("runs/si"));
        assert_eq!(job.input_file, "si.pwi");
        assert_eq!(job.output_file, "si.pwo");
        assert_eq!(job.command, "pw.x -in si.pwi > si.pwo");
        assert_eq!(job.script_name, ".job_file");
        assert_eq!(job.scheduler, SchedulerKind::Slurm);
        assert!(job.job_id.is_none());
    }

    #[test]
    fn test_params_expand_to_cartesian_product() {
        let spec = spec(
            r#"
directory: "runs/ecut_{{ecut}}_k{{k}}"
prefix: "si_{{ecut}}_{{k}}"
command: "mpirun -np 4 pw.x -in {{input}} > {{output}}"
params:
  ecut: ["30", "40"]
  k: ["4", "6", "8"]
"#,
        );
        let jobs = spec
            .expand(&mut template_registry(), &Host::new("hpc", "alice"), SchedulerKind::Pbs)
            .unwrap();

        assert_eq!(jobs.len(), 6);
        assert_eq!(jobs[0].local_dir, PathBuf::from("runs/ecut_30_k4"));
        assert_eq!(jobs[5].name, "si_40_8");
        assert_eq!(jobs[5].command, "mpirun -np 4 pw.x -in si_40_8.pwi > si_40_8.pwo");
    }

    #[test]
    fn test_values_are_not_html_escaped() {
        let spec = spec(
            r#"
directory: runs/si
prefix: si
command: "{{launcher}} pw.x < {{input}}"
params:
  launcher: ["srun --export='ALL'"]
"#,
        );
        let jobs = spec
            .expand(&mut template_registry(), &Host::new("hpc", "alice"), SchedulerKind::Slurm)
            .unwrap();
        assert_eq!(jobs[0].command, "srun --export='ALL' pw.x < si.pwi");
    }

    #[test]
    fn test_host_fields_are_available() {
        let spec = spec("directory: runs/si\nprefix: si\ncommand: echo {{username}}@{{hostname}}\n");
        let jobs = spec
            .expand(&mut template_registry(), &Host::new("hpc", "alice"), SchedulerKind::Direct)
            .unwrap();
        assert_eq!(jobs[0].command, "echo alice@hpc");
    }

    #[test]
    fn test_unknown_param_is_an_error() {
        let spec = spec("directory: runs/si\nprefix: si\ncommand: pw.x -nk {{pools}}\n");
        let err = spec
            .expand(&mut template_registry(), &Host::new("hpc", "alice"), SchedulerKind::Slurm)
            .unwrap_err();
        assert!(matches!(err, SimrunError::Config(_)));
    }

    #[test]
    fn test_load_jobs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
- directory: runs/si
  prefix: si
  command: pw.x -in {{{{input}}}}
  assets: [Si.pbe-n-kjpaw_psl.1.0.0.UPF]
  asset_dir: /opt/pseudo
- directory: runs/c
  prefix: c
  command: pw.x
"#
        )
        .unwrap();

        let specs = load_jobs(file.path().to_str().unwrap()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].assets, vec!["Si.pbe-n-kjpaw_psl.1.0.0.UPF"]);
        assert_eq!(specs[0].asset_dir, Some(PathBuf::from("/opt/pseudo")));
        assert_eq!(specs[0].command, "pw.x -in {{input}}");
    }

    #[test]
    fn test_descriptor_paths() {
        let job = JobDescriptor::new("si", "/work/si", "pw.x");
        assert_eq!(job.input_path(), PathBuf::from("/work/si/si.pwi"));
        assert_eq!(job.output_path(), PathBuf::from("/work/si/si.pwo"));
        assert_eq!(job.script_path(), PathBuf::from("/work/si/.job_file"));
    }
}
