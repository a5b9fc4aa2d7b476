//! Startup command composition: package-manager detection and the in-container
//! shell script that conditionally installs dependencies before execing the
//! dev server.

use crate::config::{Config, PackageManager};
use std::path::Path;

/// Detect the package manager from lockfile presence, in priority order,
/// falling back to the configured default when no lockfile is present.
pub fn detect_package_manager(app_path: &Path, config: &Config) -> PackageManager {
    if app_path.join("pnpm-lock.yaml").exists() {
        PackageManager::Pnpm
    } else if app_path.join("yarn.lock").exists() {
        PackageManager::Yarn
    } else if app_path.join("package-lock.json").exists() {
        PackageManager::Npm
    } else {
        config.default_package_manager
    }
}

/// Named volume + in-container mount point for the package manager's local
/// store, kept separate from the `appPath` bind mount so a reinstall doesn't
/// re-download the world. Named `dyad-pnpm-<appId>` etc. per the stable
/// naming convention; the volume is left in place on `stop` and only an
/// operator-level prune reclaims it, since `remove` does not free volumes
/// (see DESIGN.md).
pub fn package_store_volume(manager: PackageManager, app_id: &str) -> (String, String) {
    match manager {
        PackageManager::Npm => (format!("dyad-npm-{app_id}"), "/app/.npm".to_string()),
        PackageManager::Pnpm => (format!("dyad-pnpm-{app_id}"), "/app/.pnpm-store".to_string()),
        PackageManager::Yarn => (format!("dyad-yarn-{app_id}"), "/app/.yarn/cache".to_string()),
    }
}

fn install_command(manager: PackageManager) -> &'static str {
    match manager {
        PackageManager::Npm => "npm install",
        PackageManager::Pnpm => "pnpm install",
        PackageManager::Yarn => "yarn install",
    }
}

/// Build the shell script passed as the container entrypoint command: hash
/// `package.json`, skip install when `node_modules` is already consistent
/// with it, then exec the dev server bound to `0.0.0.0:port`.
///
/// `start_command`/`install_command` let the caller override either step;
/// `start_command`, if given, has a port flag injected when it doesn't
/// already carry one, using well-known per-tool conventions.
pub fn compose_startup_script(
    manager: PackageManager,
    port: u16,
    start_command: Option<&str>,
    install_command_override: Option<&str>,
) -> String {
    let install_cmd = install_command_override
        .map(|s| s.to_string())
        .unwrap_or_else(|| install_command(manager).to_string());

    let start_cmd = effective_start_command(manager, port, start_command);

    format!(
        r#"set -e
NEW_HASH=$(sha256sum package.json | cut -d' ' -f1)
OLD_HASH=$(cat .dependency-hash 2>/dev/null || echo "")
if [ "$NEW_HASH" != "$OLD_HASH" ] || [ ! -d node_modules ]; then
  {install_cmd}
  echo "$NEW_HASH" > .dependency-hash
fi
exec {start_cmd}
"#
    )
}

/// Resolve the dev-server start command: an override, with a port flag
/// injected per §4.4's "Custom command override", or the package-manager
/// default. Shared by `compose_startup_script` (container path) and the
/// local-process fallback, which has no install step of its own.
pub fn effective_start_command(manager: PackageManager, port: u16, start_command: Option<&str>) -> String {
    match start_command {
        Some(cmd) => inject_port_flag(cmd, port),
        None => default_start_command(manager, port),
    }
}

fn default_start_command(manager: PackageManager, port: u16) -> String {
    match manager {
        PackageManager::Npm => format!("npm run dev -- --host 0.0.0.0 --port {port}"),
        PackageManager::Pnpm => format!("pnpm run dev -- --host 0.0.0.0 --port {port}"),
        PackageManager::Yarn => format!("yarn dev --host 0.0.0.0 --port {port}"),
    }
}

/// If `command` has no recognizable port flag, append one using the
/// convention most dev-server CLIs in this ecosystem use. Commands that
/// already specify a port (any of the recognized flags) are left untouched.
fn inject_port_flag(command: &str, port: u16) -> String {
    const PORT_MARKERS: &[&str] = &["--port", "-p ", "PORT="];
    if PORT_MARKERS.iter().any(|m| command.contains(m)) {
        return command.to_string();
    }

    if command.contains("next") {
        format!("{command} -p {port}")
    } else if command.contains("react-scripts") {
        format!("PORT={port} {command}")
    } else {
        // Vite and most other dev servers accept `--port`.
        format!("{command} --port {port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn package_store_volume_names_follow_convention() {
        let (name, mount) = package_store_volume(PackageManager::Pnpm, "app-a");
        assert_eq!(name, "dyad-pnpm-app-a");
        assert_eq!(mount, "/app/.pnpm-store");
    }

    #[test]
    fn detects_pnpm_over_others() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        fs::write(dir.path().join("package-lock.json"), "").unwrap();
        let manager = detect_package_manager(dir.path(), &Config::default());
        assert_eq!(manager, PackageManager::Pnpm);
    }

    #[test]
    fn detects_yarn() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("yarn.lock"), "").unwrap();
        let manager = detect_package_manager(dir.path(), &Config::default());
        assert_eq!(manager, PackageManager::Yarn);
    }

    #[test]
    fn falls_back_to_configured_default() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.default_package_manager = PackageManager::Pnpm;
        let manager = detect_package_manager(dir.path(), &config);
        assert_eq!(manager, PackageManager::Pnpm);
    }

    #[test]
    fn script_conditionally_installs_and_execs() {
        let script = compose_startup_script(PackageManager::Npm, 32100, None, None);
        assert!(script.contains("npm install"));
        assert!(script.contains("exec npm run dev -- --host 0.0.0.0 --port 32100"));
    }

    #[test]
    fn injects_vite_style_port_flag() {
        let cmd = inject_port_flag("vite", 4000);
        assert_eq!(cmd, "vite --port 4000");
    }

    #[test]
    fn injects_next_style_port_flag() {
        let cmd = inject_port_flag("next dev", 4000);
        assert_eq!(cmd, "next dev -p 4000");
    }

    #[test]
    fn injects_react_scripts_port_env() {
        let cmd = inject_port_flag("react-scripts start", 4000);
        assert_eq!(cmd, "PORT=4000 react-scripts start");
    }

    #[test]
    fn leaves_existing_port_flag_untouched() {
        let cmd = inject_port_flag("vite --port 5173", 4000);
        assert_eq!(cmd, "vite --port 5173");
    }
}
