/*
 * Created on Thu Jan 02 2025
 *
 * This file is a part of cfgtreed
 * cfgtreed is a persistent, hierarchical configuration store for
 * multi-process devices written to let clients publish, read and update
 * typed settings in a tree of named nodes, transactionally, with
 * change-notification for watchers of any path.
 *
 * Copyright (c) 2025, Config Tree Daemon Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! `cfgtreed`: boots a [`cfgtree::Core`] and drives it from a single-threaded
//! event loop until interrupted (spec §5, SPEC_FULL §5's implementation
//! note). There is no RPC dispatch here — that collaborator is explicitly out
//! of scope (spec §1) — so this binary is the minimal "someone has to own the
//! `Core` value and call `poll_timeouts`" harness a real server would wrap.

use cfgtree::collab::OwnTreeOnly;
use cfgtree::config;
use cfgtree::core::Core;
use env_logger::Builder;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

const PID_FILE_NAME: &str = "cfgtreed.pid";

#[derive(Debug, Clone)]
struct DaemonUser(String);

impl cfgtree::collab::User for DaemonUser {
    fn name(&self) -> &str {
        &self.0
    }
}

fn main() {
    let config_path = env::args().nth(1).unwrap_or_else(|| "cfgtreed.yaml".to_owned());
    let cfg = config::load(Path::new(&config_path)).unwrap_or_else(|e| {
        eprintln!("could not load configuration from '{config_path}': {e}");
        process::exit(0x100);
    });

    Builder::new().parse_filters(&env::var("CFGTREED_LOG").unwrap_or_else(|_| cfg.log_level.clone())).init();

    let pid_path = cfg.data_dir.join(PID_FILE_NAME);
    let _pid_file = run_pre_startup_tasks(&pid_path);

    log::info!("cfgtreed starting, data directory: {}", cfg.data_dir.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start the single-threaded event loop");

    runtime.block_on(async move {
        let mut core: Core<DaemonUser> = Core::new(cfg, OwnTreeOnly);
        let mut shutdown = Box::pin(tokio::signal::ctrl_c());
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("received shutdown signal, stopping");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    core.poll_timeouts();
                }
            }
        }
    });

    if let Err(e) = fs::remove_file(&pid_path) {
        log::error!("shutdown failure: failed to remove pid file: {e}");
        process::exit(0x100);
    }
    log::info!("cfgtreed stopped");
}

/// Refuses to start if another process already claims the data directory
/// (same failure mode the teacher's `run_pre_startup_tasks` guards against),
/// then writes this process's own PID so the next startup can detect us.
fn run_pre_startup_tasks(pid_path: &PathBuf) -> fs::File {
    if pid_path.exists() {
        let pid = fs::read_to_string(pid_path).unwrap_or_else(|_| "unknown".to_owned());
        log::error!("startup failure: another process with PID {pid} is using this data directory");
        process::exit(0x100);
    }
    if let Some(parent) = pid_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let mut file = fs::OpenOptions::new().create(true).write(true).open(pid_path).unwrap_or_else(|e| {
        log::error!("startup failure: could not create pid file: {e}");
        process::exit(0x100);
    });
    use std::io::Write;
    if let Err(e) = write!(file, "{}", process::id()) {
        log::error!("startup failure: could not write pid file: {e}");
        process::exit(0x100);
    }
    file
}
