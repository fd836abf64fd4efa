//! The tree shared across threads, the way FUSE worker threads see it.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use rand::Rng;

use memfs::tree::{FsError, MemTree, ROOT_INO};

const THREADS: usize = 8;

#[test]
fn concurrent_creates_get_unique_inodes() {
    let tree = Arc::new(MemTree::new(0o777));
    let per_thread = 200;

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let dir = tree.mkdir(ROOT_INO, format!("t{}", t), 0o755).unwrap();
                let mut inos = vec![dir.ino];
                for i in 0..per_thread {
                    inos.push(tree.create(dir.ino, format!("f{}", i), 0o644).unwrap().ino);
                }
                inos
            })
        })
        .collect();

    let mut all = Vec::new();
    for w in workers {
        all.extend(w.join().unwrap());
    }
    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * (per_thread + 1));
    assert!(!unique.contains(&ROOT_INO));
    assert_eq!(tree.stats().files as usize, THREADS * per_thread);
}

#[test]
fn racing_creates_of_one_name_have_a_single_winner() {
    let tree = Arc::new(MemTree::new(0o777));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || tree.create(ROOT_INO, "contested", 0o644))
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter(|r| r.is_err())
        .all(|r| *r == Err(FsError::AlreadyExists)));
    assert_eq!(tree.lookup(ROOT_INO, "contested").unwrap().ino, winners[0].ino);
}

#[test]
fn writes_are_never_torn() {
    let tree = Arc::new(MemTree::new(0o777));
    let f = tree.create(ROOT_INO, "shared", 0o644).unwrap();
    let block = 4096;

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let fill = vec![b'a' + t as u8; block];
                for _ in 0..100 {
                    tree.write(f.ino, 0, &fill).unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for _ in 0..500 {
                let data = tree.read(f.ino, 0, block).unwrap();
                if let Some(&first) = data.first() {
                    assert_eq!(data.len(), block);
                    assert!(data.iter().all(|&b| b == first), "torn write observed");
                }
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();
}

#[test]
fn random_mutations_keep_tree_consistent() {
    let tree = Arc::new(MemTree::new(0o777));
    let dirs: Vec<u64> = (0..4)
        .map(|i| tree.mkdir(ROOT_INO, format!("d{}", i), 0o755).unwrap().ino)
        .collect();
    let dirs = Arc::new(dirs);

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let dirs = Arc::clone(&dirs);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..500 {
                    let from = dirs[rng.gen_range(0..dirs.len())];
                    let to = dirs[rng.gen_range(0..dirs.len())];
                    let name = format!("n{}", rng.gen_range(0..16));
                    let other = format!("n{}", rng.gen_range(0..16));
                    // Errors are expected as names come and go.
                    let _ = match rng.gen_range(0..5) {
                        0 => tree.create(from, &name, 0o644).map(|_| ()),
                        1 => tree.unlink(from, &name),
                        2 => tree.rename(from, &name, to, &other),
                        3 => tree
                            .lookup(from, &name)
                            .and_then(|st| tree.write(st.ino, 0, b"x").map(|_| ())),
                        _ => tree.symlink(from, &name, "target").map(|_| ()),
                    };
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    // Every entry resolves, and the node count matches what is reachable.
    let mut reachable = HashSet::from([ROOT_INO]);
    for &dir in dirs.iter() {
        reachable.insert(dir);
        for entry in tree.list(dir).unwrap() {
            let st = tree.getattr(entry.ino).unwrap();
            assert_eq!(st.kind, entry.kind);
            reachable.insert(entry.ino);
        }
    }
    let stats = tree.stats();
    assert_eq!(stats.orphans, 0);
    assert_eq!(stats.nodes() as usize, reachable.len());
}
