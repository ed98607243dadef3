use std::path::PathBuf;
use std::thread::JoinHandle;

use chrono::Local;
use log::{error, info};

/// Where archived command lists go.
#[derive(Debug, Clone)]
pub struct ArchiveTargets {
    /// File republished for the live-data page on every run.
    pub livedata_file: PathBuf,
    /// Directory collecting a timestamped copy of every list, for posterity.
    pub posterity_dir: PathBuf,
}

/// Archive a formatted command list.
///
/// Runs in a worker thread so the slow shared filesystem never stalls the
/// sequencing thread; the caller joins the returned handle at the point
/// where the archive must exist. Write trouble is logged, never fatal.
pub fn post_command_list(targets: ArchiveTargets, table_text: String) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let contents = format!("command sequence\nwritten: {timestamp}\n{table_text}");

        if let Some(parent) = targets.livedata_file.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            error!("cannot create live-data directory {parent:?}: {e}");
        }
        match std::fs::write(&targets.livedata_file, &contents) {
            Ok(()) => info!("posted command list to {:?}", targets.livedata_file),
            Err(e) => error!(
                "cannot post command list to {:?}: {e}",
                targets.livedata_file
            ),
        }

        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let posterity = targets.posterity_dir.join(format!("{stamp}-commands.txt"));
        if let Err(e) = std::fs::create_dir_all(&targets.posterity_dir) {
            error!(
                "cannot create archive directory {:?}: {e}",
                targets.posterity_dir
            );
            return;
        }
        match std::fs::write(&posterity, &contents) {
            Ok(()) => info!("archived command list as {posterity:?}"),
            Err(e) => error!("cannot archive command list to {posterity:?}: {e}"),
        }
    })
}
