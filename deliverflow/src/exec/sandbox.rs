//! Ephemeral per-stage execution environments.

use super::command::CommandSpec;
use crate::errors::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Working directory of the stage inside a container.
pub const CONTAINER_WORKDIR: &str = "/builds";

/// Workspace directory holding the state captured after setup.
pub const SESSION_DIR: &str = ".deliverflow";

/// Repository of the images committed from setup containers.
const SETUP_REPOSITORY: &str = "deliverflow-setup";

/// How stage commands are isolated from the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Isolation {
    /// Host processes with the sandbox workspace as working directory.
    #[default]
    Process,
    /// One throwaway container per command, from the stage's image, or
    /// from the image committed after setup once setup has run.
    Container {
        /// Engine binary (`docker` or `podman`).
        engine: String,
    },
}

impl Isolation {
    /// Container isolation with the given engine.
    #[must_use]
    pub fn container(engine: impl Into<String>) -> Self {
        Self::Container {
            engine: engine.into(),
        }
    }
}

/// A stage's private directory tree, removed when dropped.
///
/// `workspace` is the stage's working directory; declared artifact paths
/// are relative to it. `rootfs` stands in for the filesystem root, so an
/// install prefix such as `/opt/ws` lives at `rootfs/opt/ws`.
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    stage: String,
    image: String,
    isolation: Isolation,
    base: PathBuf,
    workspace: PathBuf,
    rootfs: PathBuf,
    env: BTreeMap<String, String>,
    mounts: Mutex<BTreeSet<PathBuf>>,
    session: Mutex<Session>,
    keep: bool,
}

/// Shell state carried from setup into every later command.
#[derive(Debug, Default)]
struct Session {
    /// Setup finished and saved its environment and working directory.
    captured: bool,
    /// The setup container was started and may need removal.
    container_started: bool,
    /// Image committed from the setup container.
    image: Option<String>,
}

impl Sandbox {
    /// Creates a fresh sandbox under `work_root/<run_id>/<stage>`.
    ///
    /// Leftovers from an earlier attempt at the same location are removed.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directories cannot be created.
    pub fn provision(
        work_root: &Path,
        run_id: Uuid,
        stage: &str,
        image: &str,
        isolation: Isolation,
        env: BTreeMap<String, String>,
    ) -> Result<Self> {
        let base = work_root.join(run_id.to_string()).join(stage);
        if base.exists() {
            fs::remove_dir_all(&base)?;
        }
        let workspace = base.join("workspace");
        let rootfs = base.join("rootfs");
        fs::create_dir_all(&workspace)?;
        fs::create_dir_all(&rootfs)?;

        tracing::debug!(stage, image, sandbox = %base.display(), "sandbox provisioned");
        let id = format!("{run_id}-{}", container_safe(stage));
        Ok(Self {
            id,
            stage: stage.to_string(),
            image: image.to_string(),
            isolation,
            base,
            workspace,
            rootfs,
            env,
            mounts: Mutex::new(BTreeSet::new()),
            session: Mutex::new(Session::default()),
            keep: false,
        })
    }

    /// Keeps the directory tree after drop, for debugging.
    #[must_use]
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Owning stage.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Declared execution image.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Isolation mode.
    #[must_use]
    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    /// Host path of the stage working directory.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Host path standing in for `/`.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Environment exported to every command.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Host location of an absolute in-sandbox path.
    #[must_use]
    pub fn host_path(&self, absolute: &str) -> PathBuf {
        let relative: PathBuf = Path::new(absolute)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.rootfs.join(relative)
    }

    /// The spelling of an absolute in-sandbox path that commands see.
    ///
    /// Under process isolation this is the host path; under container
    /// isolation it is the path itself, and its host directory is
    /// bind-mounted into every later container.
    #[must_use]
    pub fn visible_path(&self, absolute: &str) -> String {
        match self.isolation {
            Isolation::Process => self.host_path(absolute).display().to_string(),
            Isolation::Container { .. } => {
                self.mounts.lock().insert(PathBuf::from(absolute));
                absolute.to_string()
            }
        }
    }

    /// Wraps `program args...` for execution inside the sandbox.
    ///
    /// Once setup has been captured the command first restores the
    /// environment and working directory setup left behind.
    #[must_use]
    pub fn command<I, S>(&self, program: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let (program, args) = if self.session.lock().captured {
            let restore = format!(
                ". {} && cd \"$(cat {})\" && exec \"$0\" \"$@\"",
                self.session_path("env.sh"),
                self.session_path("cwd")
            );
            let mut wrapped = vec!["-c".to_string(), restore, program.to_string()];
            wrapped.extend(args);
            ("sh", wrapped)
        } else {
            (program, args)
        };

        match &self.isolation {
            Isolation::Process => self.host_command(program, args),
            Isolation::Container { engine } => {
                let image = self.session.lock().image.clone().unwrap_or_else(|| self.image.clone());
                self.container_run(engine, &["run", "--rm"])
                    .arg(image)
                    .arg(program)
                    .args(args)
            }
        }
    }

    /// Runs a shell line inside the sandbox.
    #[must_use]
    pub fn shell(&self, line: &str) -> CommandSpec {
        self.command("sh", ["-c", line])
    }

    /// Runs `lines` as one shell session that stops at the first failure.
    #[must_use]
    pub fn script(&self, lines: &[String]) -> CommandSpec {
        self.shell(&format!("set -e\n{}", lines.join("\n")))
    }

    /// The shared setup session.
    ///
    /// Runs `lines` in one shell with every assignment exported, then saves
    /// the exported environment and the working directory under
    /// [`SESSION_DIR`]. Under container isolation the container is named
    /// and kept so [`Sandbox::commit_setup`] can snapshot it.
    #[must_use]
    pub fn setup(&self, lines: &[String]) -> CommandSpec {
        let script = format!(
            "set -ae\n{}\nmkdir -p {}\nexport -p > {}\npwd > {}",
            lines.join("\n"),
            self.session_path(""),
            self.session_path("env.sh"),
            self.session_path("cwd")
        );
        match &self.isolation {
            Isolation::Process => self.host_command("sh", ["-c", script.as_str()]),
            Isolation::Container { engine } => {
                self.session.lock().container_started = true;
                self.container_run(engine, &["run", "--name", self.setup_container().as_str()])
                    .arg(self.image.as_str())
                    .args(["sh", "-c", script.as_str()])
            }
        }
    }

    /// Snapshots the setup container into an image, under container isolation.
    #[must_use]
    pub fn commit_setup(&self) -> Option<CommandSpec> {
        match &self.isolation {
            Isolation::Process => None,
            Isolation::Container { engine } => Some(
                CommandSpec::new(engine.as_str())
                    .args(["commit", self.setup_container().as_str(), self.setup_image().as_str()])
                    .cwd(&self.workspace),
            ),
        }
    }

    /// Makes later commands start from the captured setup state.
    ///
    /// `committed` switches container commands to the setup image.
    pub fn enter_session(&self, committed: bool) {
        let mut session = self.session.lock();
        session.captured = true;
        if committed {
            session.image = Some(self.setup_image());
        }
    }

    /// Engine commands removing the setup container and image.
    #[must_use]
    pub fn cleanup(&self) -> Vec<CommandSpec> {
        let Isolation::Container { engine } = &self.isolation else {
            return Vec::new();
        };
        let session = self.session.lock();
        let mut commands = Vec::new();
        if session.container_started {
            commands.push(CommandSpec::new(engine.as_str()).args(["rm", "-f", self.setup_container().as_str()]));
        }
        if let Some(image) = &session.image {
            commands.push(CommandSpec::new(engine.as_str()).args(["rmi", "-f", image.as_str()]));
        }
        commands
    }

    fn setup_container(&self) -> String {
        format!("{SETUP_REPOSITORY}-{}", self.id)
    }

    fn setup_image(&self) -> String {
        format!("{SETUP_REPOSITORY}:{}", self.id)
    }

    /// Shell-ready path of a session file as commands see it, or of the
    /// session directory when `name` is empty.
    fn session_path(&self, name: &str) -> String {
        match self.isolation {
            Isolation::Process => {
                let dir = self.workspace.join(SESSION_DIR);
                let path = if name.is_empty() { dir } else { dir.join(name) };
                shell_quote(&path.display().to_string())
            }
            Isolation::Container { .. } if name.is_empty() => format!("{CONTAINER_WORKDIR}/{SESSION_DIR}"),
            Isolation::Container { .. } => format!("{CONTAINER_WORKDIR}/{SESSION_DIR}/{name}"),
        }
    }

    /// `<engine> <verb...> -v <workspace> -w /builds [-v mounts] [-e keys]`.
    fn container_run(&self, engine: &str, verb: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new(engine)
            .args(verb.iter().copied())
            .arg("-v")
            .arg(format!("{}:{CONTAINER_WORKDIR}", self.workspace.display()))
            .args(["-w", CONTAINER_WORKDIR]);
        for mount in self.mounts.lock().iter() {
            let host = self.host_path(&mount.display().to_string());
            spec = spec.arg("-v").arg(format!("{}:{}", host.display(), mount.display()));
        }
        // Values travel through the engine's environment, not argv.
        for key in self.env.keys() {
            spec = spec.arg("-e").arg(key.as_str());
        }
        spec.cwd(&self.workspace).envs(&self.env)
    }

    /// A host command with the sandbox workspace and environment.
    ///
    /// Used for tools that drive the host, such as the container engine.
    #[must_use]
    pub fn host_command<I, S>(&self, program: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(program)
            .args(args)
            .cwd(&self.workspace)
            .envs(&self.env)
    }

    /// Copies a source tree into the workspace, skipping `.git` and `exclude`.
    ///
    /// Returns the number of files copied.
    ///
    /// # Errors
    ///
    /// Returns an IO error if reading or copying fails.
    pub fn seed_from(&self, source: &Path, exclude: &[PathBuf]) -> Result<usize> {
        let exclude: Vec<PathBuf> = exclude
            .iter()
            .filter_map(|p| p.canonicalize().ok())
            .chain(std::iter::once(self.base.canonicalize()?))
            .collect();
        let copied = copy_tree(source, &self.workspace, &exclude)?;
        tracing::debug!(stage = %self.stage, files = copied, source = %source.display(), "workspace seeded");
        Ok(copied)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.base) {
            tracing::warn!(sandbox = %self.base.display(), error = %err, "failed to remove sandbox");
        }
    }
}

/// Container names allow `[a-zA-Z0-9_.-]`.
fn container_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

/// Single-quotes `value` for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn copy_tree(source: &Path, dest: &Path, exclude: &[PathBuf]) -> Result<usize> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name() == ".git" {
            continue;
        }
        if let Ok(canonical) = path.canonicalize() {
            if exclude.iter().any(|e| canonical.starts_with(e)) {
                continue;
            }
        }
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copied += copy_tree(&path, &target, exclude)?;
        } else if file_type.is_symlink() {
            copy_symlink(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(path: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(fs::read_link(path)?, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(path: &Path, target: &Path) -> Result<()> {
    fs::copy(path, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([("CI_COMMIT_SHA".to_string(), "abc".to_string())])
    }

    #[test]
    fn test_provision_and_drop() {
        let root = tempfile::tempdir().unwrap();
        let run = Uuid::new_v4();
        let base = root.path().join(run.to_string()).join("build");
        {
            let sandbox =
                Sandbox::provision(root.path(), run, "build", "ros:humble", Isolation::Process, env()).unwrap();
            assert!(sandbox.workspace().is_dir());
            assert!(sandbox.rootfs().is_dir());
            assert!(base.exists());
        }
        assert!(!base.exists());
    }

    #[test]
    fn test_keep_survives_drop() {
        let root = tempfile::tempdir().unwrap();
        let run = Uuid::new_v4();
        drop(
            Sandbox::provision(root.path(), run, "test", "alpine", Isolation::Process, env())
                .unwrap()
                .keep(true),
        );
        assert!(root.path().join(run.to_string()).join("test").exists());
    }

    #[test]
    fn test_process_command() {
        let root = tempfile::tempdir().unwrap();
        let sandbox =
            Sandbox::provision(root.path(), Uuid::new_v4(), "build", "img", Isolation::Process, env()).unwrap();

        let prefix = sandbox.visible_path("/opt/ws");
        assert_eq!(PathBuf::from(&prefix), sandbox.rootfs().join("opt/ws"));

        let spec = sandbox.command("colcon", ["build"]);
        assert_eq!(spec.program, "colcon");
        assert_eq!(spec.cwd.as_deref(), Some(sandbox.workspace()));
        assert_eq!(spec.env.get("CI_COMMIT_SHA").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_container_command() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::provision(
            root.path(),
            Uuid::new_v4(),
            "build",
            "ros:humble",
            Isolation::container("podman"),
            env(),
        )
        .unwrap();

        assert_eq!(sandbox.visible_path("/opt/ws"), "/opt/ws");
        let spec = sandbox.shell("colcon build");

        assert_eq!(spec.program, "podman");
        assert!(spec.starts_with(&["podman", "run", "--rm", "-v"]));
        let mount = format!("{}:/opt/ws", sandbox.rootfs().join("opt/ws").display());
        assert!(spec.args.contains(&mount));
        assert!(spec.args.windows(2).any(|w| w == ["-e", "CI_COMMIT_SHA"]));
        assert!(!spec.args.iter().any(|a| a == "abc"));
        assert_eq!(&spec.args[spec.args.len() - 4..], ["ros:humble", "sh", "-c", "colcon build"]);
    }

    #[test]
    fn test_container_setup_session() {
        let root = tempfile::tempdir().unwrap();
        let run = Uuid::new_v4();
        let sandbox =
            Sandbox::provision(root.path(), run, "build", "ros:humble", Isolation::container("docker"), env()).unwrap();
        let container = format!("deliverflow-setup-{run}-build");
        let image = format!("deliverflow-setup:{run}-build");
        assert!(sandbox.cleanup().is_empty());

        let setup = sandbox.setup(&["apt-get install -y clang".to_string()]);
        assert!(setup.starts_with(&["docker", "run", "--name", container.as_str()]));
        assert!(!setup.args.iter().any(|a| a == "--rm"));
        let script = setup.args.last().unwrap();
        assert!(script.starts_with("set -ae\napt-get install -y clang\n"));
        assert!(script.contains("export -p > /builds/.deliverflow/env.sh"));

        let commit = sandbox.commit_setup().unwrap();
        assert_eq!(commit.args, ["commit", container.as_str(), image.as_str()]);

        sandbox.enter_session(true);
        let spec = sandbox.command("colcon", ["build"]);
        let at = spec.args.iter().position(|a| *a == image).unwrap();
        assert_eq!(&spec.args[at + 1..at + 3], ["sh", "-c"]);
        assert!(spec.args[at + 3].starts_with(". /builds/.deliverflow/env.sh"));
        assert_eq!(&spec.args[at + 4..], ["colcon", "build"]);

        let cleanup: Vec<String> = sandbox.cleanup().iter().map(ToString::to_string).collect();
        assert_eq!(
            cleanup,
            [format!("docker rm -f {container}"), format!("docker rmi -f {image}")]
        );
    }

    #[test]
    fn test_process_session_restores_setup_state() {
        let root = tempfile::tempdir().unwrap();
        let sandbox =
            Sandbox::provision(root.path(), Uuid::new_v4(), "build", "img", Isolation::Process, env()).unwrap();
        assert!(sandbox.commit_setup().is_none());

        let unwrapped = sandbox.command("colcon", ["build"]);
        assert_eq!(unwrapped.program, "colcon");

        sandbox.enter_session(false);
        let spec = sandbox.command("colcon", ["build"]);
        assert_eq!(spec.program, "sh");
        let state = sandbox.workspace().join(SESSION_DIR).join("env.sh");
        assert!(spec.args[1].contains(&state.display().to_string()));
        assert_eq!(&spec.args[2..], ["colcon", "build"]);
        assert!(sandbox.cleanup().is_empty());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_seed_from_skips_git() {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("src");
        fs::create_dir_all(source.join(".git")).unwrap();
        fs::create_dir_all(source.join("pkg")).unwrap();
        fs::write(source.join(".git/HEAD"), "ref").unwrap();
        fs::write(source.join("LICENSE"), "MIT").unwrap();
        fs::write(source.join("pkg/package.xml"), "<package/>").unwrap();

        let sandbox = Sandbox::provision(
            &root.path().join("work"),
            Uuid::new_v4(),
            "build",
            "img",
            Isolation::Process,
            BTreeMap::new(),
        )
        .unwrap();
        let copied = sandbox.seed_from(&source, &[]).unwrap();

        assert_eq!(copied, 2);
        assert!(sandbox.workspace().join("pkg/package.xml").is_file());
        assert!(!sandbox.workspace().join(".git").exists());
    }
}
