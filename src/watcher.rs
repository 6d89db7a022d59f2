use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::events::{EventSender, VaultEvent};

/// Watches the vault and feeds `VaultEvent`s into the engine's channel.
/// Dropping it stops the watch.
pub struct VaultWatcher {
    _watcher: RecommendedWatcher,
}

pub fn spawn(root: &Path, tx: EventSender) -> Result<VaultWatcher> {
    let root_buf = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let Ok(event) = res else {
                return;
            };
            for translated in translate(&root_buf, &event) {
                // The engine loop owns backpressure; a full channel just
                // means a scan will pick the change up later.
                let _ = tx.blocking_send(translated);
            }
        },
        NotifyConfig::default(),
    )
    .context("create filesystem watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;
    Ok(VaultWatcher { _watcher: watcher })
}

fn translate(root: &Path, event: &Event) -> Vec<VaultEvent> {
    match &event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => rel_paths(root, &event.paths)
            .into_iter()
            .map(VaultEvent::Created)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let rels = rel_paths(root, &event.paths);
            if rels.len() == 2 {
                let from = rels[0].clone();
                let to = rels[1].clone();
                let renamed_dir = event
                    .paths
                    .get(1)
                    .map(|p| p.is_dir())
                    .unwrap_or(false);
                if renamed_dir {
                    vec![VaultEvent::FolderRenamed { from, to }]
                } else {
                    vec![VaultEvent::Renamed { from, to }]
                }
            } else {
                Vec::new()
            }
        }
        // Rename halves delivered separately degrade to delete + create.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => rel_paths(root, &event.paths)
            .into_iter()
            .map(VaultEvent::Deleted)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => rel_paths(root, &event.paths)
            .into_iter()
            .map(VaultEvent::Created)
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => rel_paths(root, &event.paths)
            .into_iter()
            .map(VaultEvent::Modified)
            .collect(),
        EventKind::Remove(RemoveKind::Folder) => rel_paths(root, &event.paths)
            .into_iter()
            .map(VaultEvent::FolderDeleted)
            .collect(),
        EventKind::Remove(_) => rel_paths(root, &event.paths)
            .into_iter()
            .map(VaultEvent::Deleted)
            .collect(),
        _ => Vec::new(),
    }
}

fn rel_paths(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.strip_prefix(root).ok())
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut ev = Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        ev
    }

    #[test]
    fn create_and_modify_map_to_vault_events() {
        let root = Path::new("/vault");
        let out = translate(
            root,
            &event(EventKind::Create(CreateKind::File), &["/vault/notes/a.md"]),
        );
        assert_eq!(out, vec![VaultEvent::Created("notes/a.md".into())]);

        let out = translate(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
                &["/vault/notes/a.md"],
            ),
        );
        assert_eq!(out, vec![VaultEvent::Modified("notes/a.md".into())]);
    }

    #[test]
    fn folder_creation_is_silent() {
        let root = Path::new("/vault");
        let out = translate(
            root,
            &event(EventKind::Create(CreateKind::Folder), &["/vault/notes"]),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn removes_distinguish_files_and_folders() {
        let root = Path::new("/vault");
        let out = translate(
            root,
            &event(EventKind::Remove(RemoveKind::File), &["/vault/a.md"]),
        );
        assert_eq!(out, vec![VaultEvent::Deleted("a.md".into())]);

        let out = translate(
            root,
            &event(EventKind::Remove(RemoveKind::Folder), &["/vault/notes"]),
        );
        assert_eq!(out, vec![VaultEvent::FolderDeleted("notes".into())]);
    }

    #[test]
    fn two_path_rename_maps_to_renamed() {
        let root = Path::new("/vault");
        let out = translate(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/vault/old.md", "/vault/new.md"],
            ),
        );
        assert_eq!(
            out,
            vec![VaultEvent::Renamed {
                from: "old.md".into(),
                to: "new.md".into(),
            }]
        );
    }

    #[test]
    fn paths_outside_root_are_dropped() {
        let root = Path::new("/vault");
        let out = translate(
            root,
            &event(EventKind::Create(CreateKind::File), &["/elsewhere/a.md"]),
        );
        assert!(out.is_empty());
    }
}
