use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use memfs::config::{Cli, Command, MemfsConfig};
use memfs::fs::handles::HandleTable;
use memfs::fs::MemFs;

/// Write-end of the self-pipe used for signal notification.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(_sig: libc::c_int) {
    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}

enum ShutdownAction {
    /// Second signal: force unmount.
    ForceUnmount,
    /// FUSE session ended on its own, or first-signal probe unmount succeeded.
    ExternalUnmount,
}

/// Attempt a regular (non-forced) unmount. Returns true if the mount was
/// removed, i.e. it was not busy.
fn try_unmount(mountpoint: &Path) -> bool {
    std::process::Command::new("umount")
        .arg(mountpoint)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Block until shutdown conditions are met:
/// - first signal, mount not busy: clean unmount;
/// - first signal, mount busy: warn and wait, re-probing about once a second;
/// - second signal: force unmount;
/// - FUSE session exits on its own: external unmount.
fn wait_for_shutdown(
    guard: &std::thread::JoinHandle<std::io::Result<()>>,
    file_handles: &HandleTable,
    mountpoint: &Path,
) -> ShutdownAction {
    let mut pipe_fds = [0 as libc::c_int; 2];
    assert_eq!(
        unsafe { libc::pipe(pipe_fds.as_mut_ptr()) },
        0,
        "failed to create signal pipe"
    );

    SIGNAL_PIPE.store(pipe_fds[1], Ordering::Relaxed);

    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGHUP, SigHandler::Handler(signal_handler)).ok();
    }

    let mut first_signal_received = false;
    let mut poll_ticks: u32 = 0;

    let action = loop {
        let mut pfd = libc::pollfd {
            fd: pipe_fds[0],
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 200) }; // 200 ms timeout

        if ret > 0 {
            let mut buf = [0u8; 1];
            unsafe {
                libc::read(pipe_fds[0], buf.as_mut_ptr() as *mut libc::c_void, 1);
            }

            if first_signal_received {
                eprintln!("memfs: force unmounting...");
                break ShutdownAction::ForceUnmount;
            }

            if guard.is_finished() {
                break ShutdownAction::ExternalUnmount;
            }

            if try_unmount(mountpoint) {
                eprintln!("memfs: unmounting (received signal)...");
                break ShutdownAction::ExternalUnmount;
            }

            first_signal_received = true;
            let open_files = file_handles.list_open();
            if open_files.is_empty() {
                eprintln!("memfs: mount is busy, processes are using the mountpoint");
            } else {
                eprintln!("memfs: mount is busy, {} open file(s):", open_files.len());
                let display_cap = 10;
                for info in open_files.iter().take(display_cap) {
                    eprintln!("  inode {}  (pid {})", info.ino, info.pid);
                }
                if open_files.len() > display_cap {
                    eprintln!("  and {} more...", open_files.len() - display_cap);
                }
            }
            eprintln!(
                "Close open files to unmount cleanly, or press ctrl-C again to force unmount."
            );
            continue;
        }

        if guard.is_finished() {
            break ShutdownAction::ExternalUnmount;
        }

        if first_signal_received {
            poll_ticks += 1;
            if poll_ticks % 5 == 0 && try_unmount(mountpoint) {
                eprintln!("memfs: all clear, unmounting...");
                break ShutdownAction::ExternalUnmount;
            }
        }
    };

    SIGNAL_PIPE.store(-1, Ordering::Relaxed);
    unsafe {
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
    }

    action
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            mountpoint,
            mode,
            fs_name,
            log_file,
            demo,
        } => {
            if !mountpoint.exists() {
                if let Err(e) = std::fs::create_dir_all(&mountpoint) {
                    eprintln!("Error creating mountpoint {:?}: {}", mountpoint, e);
                    std::process::exit(1);
                }
            }

            let mountpoint = std::fs::canonicalize(&mountpoint).unwrap_or_else(|e| {
                eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
                std::process::exit(1);
            });

            if !mountpoint.is_dir() {
                eprintln!("Error: mountpoint is not a directory: {:?}", mountpoint);
                std::process::exit(1);
            }

            let log_dir = log_file.parent().unwrap_or_else(|| Path::new("/tmp"));
            let log_name = log_file
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("memfs.log"));
            let file_appender = tracing_appender::rolling::never(log_dir, log_name);
            let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

            let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false),
                )
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                );
            tracing::subscriber::set_global_default(subscriber)
                .expect("Failed to set tracing subscriber");

            let config = MemfsConfig {
                mountpoint: mountpoint.clone(),
                root_mode: mode,
                fs_name: fs_name.clone(),
                log_file,
                demo,
            };

            info!(
                "memfs starting: fs_name={}, mountpoint={}, root_mode={:#o}",
                fs_name,
                mountpoint.display(),
                mode
            );

            let memfs = MemFs::new(config.clone());

            // Keep a handle on the open-file table for the busy-mount report
            // after MemFs moves into the FUSE session.
            let mut file_handles = memfs.file_handles.clone();

            let mut fuse_config = fuser::Config::default();
            fuse_config.mount_options = vec![
                fuser::MountOption::FSName(fs_name),
                fuser::MountOption::Subtype("memfs".to_string()),
                fuser::MountOption::AutoUnmount,
            ];
            fuse_config.acl = fuser::SessionACL::All;

            info!("Mounting memfs filesystem...");

            let session = match fuser::spawn_mount2(memfs, &mountpoint, &fuse_config) {
                Ok(session) => session,
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EPERM)
                        || e.to_string().contains("allow_other")
                    {
                        fuse_config.acl = fuser::SessionACL::Owner;
                        info!("Retrying mount without allow_other...");
                        let retry_memfs = MemFs::new(config);
                        file_handles = retry_memfs.file_handles.clone();
                        match fuser::spawn_mount2(retry_memfs, &mountpoint, &fuse_config) {
                            Ok(session) => session,
                            Err(e) => {
                                error!("Failed to mount: {}", e);
                                std::process::exit(1);
                            }
                        }
                    } else {
                        error!("Failed to mount: {}", e);
                        std::process::exit(1);
                    }
                }
            };

            info!("memfs mounted at {}", mountpoint.display());

            let action = wait_for_shutdown(&session.guard, &file_handles, &mountpoint);

            match action {
                ShutdownAction::ForceUnmount => {
                    if let Err(e) = session.umount_and_join() {
                        error!("Error during unmount, trying force unmount: {}", e);
                        let mp = mountpoint.to_string_lossy();
                        let _ = std::process::Command::new("umount")
                            .args(["-f", &*mp])
                            .status();
                    }
                }
                ShutdownAction::ExternalUnmount => {
                    if let Err(e) = session.join() {
                        error!("Error joining FUSE session: {}", e);
                    }
                }
            }

            eprintln!("memfs: unmounted {}", mountpoint.display());
        }
        Command::Unmount { mountpoint } => {
            unmount(&mountpoint);
        }
    }
}

fn unmount(mountpoint: &PathBuf) {
    let mountpoint = std::fs::canonicalize(mountpoint).unwrap_or_else(|e| {
        eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
        std::process::exit(1);
    });
    let mp = mountpoint.to_string_lossy();
    eprintln!("Unmounting {}...", mp);

    let output = std::process::Command::new("umount").arg(&*mp).output();

    if matches!(&output, Ok(o) if o.status.success()) {
        eprintln!("Successfully unmounted {}", mp);
        return;
    }

    if let Ok(ref o) = output {
        let stderr = String::from_utf8_lossy(&o.stderr);
        if stderr.contains("busy") {
            eprintln!(
                "Mount point is busy. Make sure no shells or processes are using {}, then try again.",
                mp
            );
            std::process::exit(1);
        }
    }

    // fusermount covers unprivileged Linux mounts that plain umount refuses.
    let output = std::process::Command::new("fusermount")
        .args(["-u", &*mp])
        .output();

    if matches!(&output, Ok(o) if o.status.success()) {
        eprintln!("Successfully unmounted {}", mp);
        return;
    }

    let status = std::process::Command::new("umount")
        .args(["-f", &*mp])
        .status();

    if matches!(status, Ok(s) if s.success()) {
        eprintln!("Successfully unmounted {} (forced)", mp);
        return;
    }

    eprintln!("Failed to unmount {}. Try: sudo umount -f {}", mp, mp);
    std::process::exit(1);
}
