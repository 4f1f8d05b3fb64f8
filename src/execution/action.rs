//! Action Dispatch
//!
//! Runs one attempt of one task:
//! - Placeholder substitution in shell commands and tool arguments
//! - Script generation for shell actions
//! - Log capture (stdout and stderr go to the task's log file)
//! - Output discipline: actions write hidden partial files
//!   (`dir/.partial.name`, extension kept) that are renamed into place
//!   only on success
//!
//! # Placeholders
//!
//! `{input}`, `{inputs}`, `{input[i]}`, `{output}`, `{outputs}`,
//! `{output[i]}`, `{log}`, `{threads}`, `{attempt}`, `{resources.mem_mb}`,
//! `{resources.runtime}`, `{params.NAME}`, `{wildcards.NAME}` and bare
//! wildcard names such as `{sample}`.
//!
//! In shell commands, input, output and log paths are quoted when they
//! contain characters the shell would split or expand. Tool arguments are
//! passed verbatim.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, warn};

use super::aggregate::aggregate;
use super::retry::Resources;
use crate::error::TaskError;
use crate::workflow::graph::TaskInstance;
use crate::workflow::registry::RuleAction;
use crate::workflow::wildcards::{parse_indexed, render};

/// Directory for generated scripts, relative to the working directory.
const SCRIPT_DIR: &str = ".seqflow/scripts";

/// Returns the hidden partial path an action writes instead of `output`.
///
/// # Example
///
/// ```
/// use seqflow::execution::action::partial_path;
///
/// assert_eq!(partial_path("aligned/A.bam"), "aligned/.partial.A.bam");
/// assert_eq!(partial_path("table.tsv"), ".partial.table.tsv");
/// ```
pub fn partial_path(output: &str) -> String {
    match output.rsplit_once('/') {
        Some((dir, name)) => format!("{}/.partial.{}", dir, name),
        None => format!(".partial.{}", output),
    }
}

/// Quotes `path` for bash unless it only holds characters that need none.
fn shell_quote(path: &str) -> String {
    let plain = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./+:=@%,".contains(c));
    if plain {
        path.to_string()
    } else {
        format!("'{}'", path.replace('\'', "'\\''"))
    }
}

/// Values available to command templates of one attempt.
struct Placeholders<'a> {
    task: &'a TaskInstance,
    partials: &'a [String],
    attempt: u32,
    resources: Resources,
    /// Quote paths for the shell
    quote: bool,
}

impl Placeholders<'_> {
    fn path(&self, path: &str) -> String {
        if self.quote {
            shell_quote(path)
        } else {
            path.to_string()
        }
    }

    fn paths(&self, paths: &[String]) -> String {
        paths
            .iter()
            .map(|p| self.path(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "input" | "inputs" => return Some(self.paths(&self.task.inputs)),
            "output" | "outputs" => return Some(self.paths(self.partials)),
            "log" => return Some(self.path(&self.task.log)),
            "threads" => return Some(self.resources.threads.to_string()),
            "attempt" => return Some(self.attempt.to_string()),
            "resources.mem_mb" => return Some(self.resources.mem_mb.to_string()),
            "resources.runtime" => return Some(self.resources.runtime.to_string()),
            _ => {}
        }
        if let Some(param) = name.strip_prefix("params.") {
            return self.task.params.get(param).cloned();
        }
        if let Some(wildcard) = name.strip_prefix("wildcards.") {
            return self.task.binding.get(wildcard).cloned();
        }
        if let Some((base, index)) = parse_indexed(name) {
            return match base {
                "input" => self.task.inputs.get(index).map(|p| self.path(p)),
                "output" => self.partials.get(index).map(|p| self.path(p)),
                _ => None,
            };
        }
        self.task.binding.get(name).cloned()
    }

    /// Expands one tool argument. A list placeholder standing alone becomes
    /// one argument per path.
    fn expand_arg(&self, arg: &str) -> Result<Vec<String>, TaskError> {
        match arg {
            "{input}" | "{inputs}" => Ok(self.task.inputs.clone()),
            "{output}" | "{outputs}" => Ok(self.partials.to_vec()),
            _ => Ok(vec![render(arg, |name| self.lookup(name))?]),
        }
    }
}

/// Renders what an attempt would run, with declared output paths in place
/// of partials. Used for dry runs.
pub fn render_command(
    task: &TaskInstance,
    action: &RuleAction,
    attempt: u32,
    resources: Resources,
) -> Result<String, TaskError> {
    let placeholders = Placeholders {
        task,
        partials: &task.outputs,
        attempt,
        resources,
        quote: matches!(action, RuleAction::Shell { .. }),
    };

    match action {
        RuleAction::Shell { command } => Ok(render(command, |name| placeholders.lookup(name))?),
        RuleAction::Tool { program, args } => {
            let mut line = vec![program.clone()];
            for arg in args {
                line.extend(placeholders.expand_arg(arg)?);
            }
            Ok(line.join(" "))
        }
        RuleAction::Aggregate { rule, .. } => Ok(format!(
            "aggregate {} output(s) of '{}' into {}",
            task.inputs.len(),
            rule,
            task.outputs.join(", ")
        )),
    }
}

/// Executes one attempt of `task`.
///
/// Paths are relative to `root`, which is also the working directory of
/// spawned processes. On failure every partial output is removed.
pub fn execute_action(
    task: &TaskInstance,
    action: &RuleAction,
    attempt: u32,
    resources: Resources,
    root: &Path,
) -> Result<(), TaskError> {
    let partials: Vec<String> = task.outputs.iter().map(|o| partial_path(o)).collect();

    ensure_output_directories(&task.outputs, root)?;
    remove_partials(&partials, root);

    let result = dispatch(task, action, &partials, attempt, resources, root)
        .and_then(|()| commit_outputs(&task.outputs, &partials, root));

    if result.is_err() {
        remove_partials(&partials, root);
    }
    result
}

fn dispatch(
    task: &TaskInstance,
    action: &RuleAction,
    partials: &[String],
    attempt: u32,
    resources: Resources,
    root: &Path,
) -> Result<(), TaskError> {
    let placeholders = Placeholders {
        task,
        partials,
        attempt,
        resources,
        quote: matches!(action, RuleAction::Shell { .. }),
    };
    let log_path = root.join(&task.log);
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut log = File::create(&log_path)?;

    match action {
        RuleAction::Shell { command } => {
            let command_text = render(command, |name| placeholders.lookup(name))?;
            debug!("{}: {}", task.label(), command_text);

            let script_path = create_execution_script(task, attempt, &command_text, root)?;
            let mut cmd = Command::new("bash");
            cmd.arg(&script_path);
            let result = run_logged(cmd, "bash", log, &task.log, root);

            if let Err(e) = fs::remove_file(&script_path) {
                warn!("Failed to clean up script {}: {}", script_path.display(), e);
            }
            result
        }
        RuleAction::Tool { program, args } => {
            let mut expanded = Vec::new();
            for arg in args {
                expanded.extend(placeholders.expand_arg(arg)?);
            }
            debug!("{}: {} {}", task.label(), program, expanded.join(" "));

            let mut cmd = Command::new(program);
            cmd.args(&expanded);
            run_logged(cmd, program, log, &task.log, root)
        }
        RuleAction::Aggregate {
            convention, info, ..
        } => {
            let table = root.join(partials.first().map(String::as_str).unwrap_or_default());
            let summary = root.join(partials.get(1).map(String::as_str).unwrap_or_default());
            let stages = aggregate(root, &task.inputs, convention, info, &table, &summary)?;
            writeln!(
                log,
                "aggregated {} file(s): {} sample(s), columns {:?}",
                task.inputs.len(),
                stages.samples().len(),
                stages.columns()
            )?;
            Ok(())
        }
    }
}

/// Spawns `cmd` in `root` with stdout and stderr appended to `log`.
fn run_logged(
    mut cmd: Command,
    program: &str,
    log: File,
    log_display: &str,
    root: &Path,
) -> Result<(), TaskError> {
    let stderr = log.try_clone()?;
    cmd.current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr));

    let status = cmd.status().map_err(|source| TaskError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(TaskError::ExitStatus {
            code: status.code(),
            log: log_display.to_string(),
        })
    }
}

/// Creates parent directories for output files.
fn ensure_output_directories(outputs: &[String], root: &Path) -> Result<(), TaskError> {
    for output in outputs {
        if let Some(parent) = root.join(output).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Writes the command into a bash script under `.seqflow/scripts/`.
fn create_execution_script(
    task: &TaskInstance,
    attempt: u32,
    command_text: &str,
    root: &Path,
) -> Result<PathBuf, TaskError> {
    let script_dir = root.join(SCRIPT_DIR);
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!("task-{}-{}.sh", task.id.0, attempt));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Renames every partial into place. All partials must exist.
fn commit_outputs(outputs: &[String], partials: &[String], root: &Path) -> Result<(), TaskError> {
    if let Some((output, _)) = outputs
        .iter()
        .zip(partials)
        .find(|(_, partial)| !root.join(partial).exists())
    {
        return Err(TaskError::MissingOutput(output.clone()));
    }

    for (output, partial) in outputs.iter().zip(partials) {
        fs::rename(root.join(partial), root.join(output))?;
        debug!("Committed {}", output);
    }
    Ok(())
}

fn remove_partials(partials: &[String], root: &Path) {
    for partial in partials {
        let path = root.join(partial);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove partial output {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::aggregate::{StageConvention, SummaryInfo};
    use crate::workflow::graph::{TaskId, TaskKind};
    use crate::workflow::wildcards::{Binding, Template};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn task(inputs: &[&str], outputs: &[&str]) -> TaskInstance {
        let mut binding = Binding::new();
        binding.insert("sample".to_string(), "A".to_string());
        let mut params = BTreeMap::new();
        params.insert("greeting".to_string(), "hello".to_string());

        TaskInstance {
            id: TaskId(0),
            rule: "test".to_string(),
            binding,
            kind: TaskKind::Concrete,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            log: "logs/test.log".to_string(),
            params,
        }
    }

    fn shell(command: &str) -> RuleAction {
        RuleAction::Shell {
            command: command.to_string(),
        }
    }

    fn resources() -> Resources {
        Resources {
            mem_mb: 2048,
            runtime: 30,
            threads: 2,
        }
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(partial_path("a/b/c.txt"), "a/b/.partial.c.txt");
        assert_eq!(partial_path("c.txt"), ".partial.c.txt");
    }

    #[test]
    fn test_partial_keeps_extension() {
        let dir = tempdir().unwrap();
        let task = task(&[], &["aligned/A.bam"]);
        let command = "case {output} in *.bam) touch {output};; *) echo got {output}; exit 1;; esac";

        execute_action(&task, &shell(command), 1, resources(), dir.path()).unwrap();
        assert!(dir.path().join("aligned/A.bam").exists());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("aligned/A-1.bam"), "aligned/A-1.bam");
        assert_eq!(shell_quote("my reads/A.fq"), "'my reads/A.fq'");
        assert_eq!(shell_quote("it's.txt"), "'it'\\''s.txt'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_paths_with_spaces_stay_one_word() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("my reads")).unwrap();
        fs::write(dir.path().join("my reads/A.txt"), "spaced\n").unwrap();
        let task = task(&["my reads/A.txt"], &["out dir/A copy.txt"]);

        execute_action(&task, &shell("cp {input} {output}"), 1, resources(), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("out dir/A copy.txt")).unwrap(),
            "spaced\n"
        );

        let rendered = render_command(&task, &shell("cat {input[0]} > {output}"), 1, resources()).unwrap();
        assert_eq!(rendered, "cat 'my reads/A.txt' > 'out dir/A copy.txt'");
    }

    #[test]
    fn test_shell_success_commits_outputs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("in.txt"), "data\n").unwrap();
        let task = task(&["in.txt"], &["out/result.txt"]);

        execute_action(&task, &shell("cp {input} {output}"), 1, resources(), dir.path()).unwrap();

        let out = dir.path().join("out/result.txt");
        assert_eq!(fs::read_to_string(out).unwrap(), "data\n");
        assert!(!dir.path().join("out/.partial.result.txt").exists());
    }

    #[test]
    fn test_placeholders_rendered() {
        let dir = tempdir().unwrap();
        let task = task(&[], &["out.txt"]);
        let command = "echo {params.greeting} {sample} {wildcards.sample} {threads} \
                       {attempt} {resources.mem_mb} {resources.runtime} > {output[0]}";

        execute_action(&task, &shell(command), 2, resources(), dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(content.trim(), "hello A A 2 2 2048 30");
    }

    #[test]
    fn test_output_goes_to_log() {
        let dir = tempdir().unwrap();
        let task = task(&[], &["out.txt"]);

        execute_action(
            &task,
            &shell("echo to-stdout; echo to-stderr >&2; touch {output}"),
            1,
            resources(),
            dir.path(),
        )
        .unwrap();

        let log = fs::read_to_string(dir.path().join("logs/test.log")).unwrap();
        assert!(log.contains("to-stdout"));
        assert!(log.contains("to-stderr"));
    }

    #[test]
    fn test_failure_removes_partials() {
        let dir = tempdir().unwrap();
        let task = task(&[], &["out.txt"]);

        let result = execute_action(
            &task,
            &shell("echo partial > {output}; exit 3"),
            1,
            resources(),
            dir.path(),
        );

        assert!(matches!(
            result,
            Err(TaskError::ExitStatus { code: Some(3), .. })
        ));
        assert!(!dir.path().join("out.txt").exists());
        assert!(!dir.path().join(".partial.out.txt").exists());
    }

    #[test]
    fn test_missing_output() {
        let dir = tempdir().unwrap();
        let task = task(&[], &["a.txt", "b.txt"]);

        let result = execute_action(&task, &shell("touch {output[0]}"), 1, resources(), dir.path());

        assert!(matches!(result, Err(TaskError::MissingOutput(path)) if path == "b.txt"));
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join(".partial.a.txt").exists());
    }

    #[test]
    fn test_tool_splices_list_arguments() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), "x\n").unwrap();
        fs::write(dir.path().join("y.txt"), "y\n").unwrap();
        let task = task(&["x.txt", "y.txt"], &["both.txt"]);
        let action = RuleAction::Tool {
            program: "bash".to_string(),
            args: vec![
                "-c".to_string(),
                "cat {inputs} > {output}".to_string(),
            ],
        };

        execute_action(&task, &action, 1, resources(), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("both.txt")).unwrap(),
            "x\ny\n"
        );

        let copy = task_with_id(&["x.txt"], &["copy.txt"]);
        let cp = RuleAction::Tool {
            program: "cp".to_string(),
            args: vec!["{input}".to_string(), "{output}".to_string()],
        };
        execute_action(&copy, &cp, 1, resources(), dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("copy.txt")).unwrap(), "x\n");
    }

    fn task_with_id(inputs: &[&str], outputs: &[&str]) -> TaskInstance {
        let mut t = task(inputs, outputs);
        t.id = TaskId(1);
        t
    }

    #[test]
    fn test_render_command_uses_declared_outputs() {
        let task = task(&["in.txt"], &["out/result.txt"]);
        let rendered = render_command(
            &task,
            &shell("sort -@ {threads} {input} > {output}"),
            1,
            resources(),
        )
        .unwrap();
        assert_eq!(rendered, "sort -@ 2 in.txt > out/result.txt");
    }

    #[test]
    fn test_missing_program() {
        let dir = tempdir().unwrap();
        let task = task(&[], &["out.txt"]);
        let action = RuleAction::Tool {
            program: "seqflow-no-such-program".to_string(),
            args: Vec::new(),
        };

        let result = execute_action(&task, &action, 1, resources(), dir.path());
        assert!(matches!(result, Err(TaskError::Spawn { .. })));
    }

    #[test]
    fn test_aggregate_action() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("counts")).unwrap();
        fs::write(dir.path().join("counts/A.raw.count"), "2000000\n").unwrap();
        let mut task = task(&["counts/A.raw.count"], &["report/table.tsv", "report/summary.json"]);
        task.kind = TaskKind::Aggregate;
        task.binding.clear();

        let action = RuleAction::Aggregate {
            rule: "count".to_string(),
            template: Template::parse("counts/{sample}.{stage}.count").unwrap(),
            convention: StageConvention::new(".count").with_label("raw", "Raw"),
            info: SummaryInfo {
                id: "report".to_string(),
                section_name: "Report".to_string(),
                description: String::new(),
                plot_type: "bargraph".to_string(),
            },
        };

        execute_action(&task, &action, 1, resources(), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("report/table.tsv")).unwrap(),
            "sample\tRaw\nA\t2\n"
        );
        assert!(dir.path().join("report/summary.json").exists());
    }
}
