//! 文件系统快照模型
//!
//! 把用户选中的文件/目录转换为一棵不可变的元数据树（不含文件内容）。
//! 这棵树既是选择结果，也是传输清单：发送端按它读取文件，接收端按它
//! 重建目录结构。
//!
//! # 遍历顺序
//!
//! 子节点保存在 `BTreeMap` 中，序列化后顺序不变，双方都按深度优先先序、
//! 名称升序遍历，文件帧因此无需额外的序号。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};

/// 顶层条目的 `dir` 值
pub const ROOT_DIR: &str = ".";

/// 目录嵌套上限，顶层条目算第 1 层
///
/// 快照跳过更深的子目录，校验拒绝更深的目录节点；第 `MAX_DEPTH` 层目录
/// 里的文件仍然保留。
pub const MAX_DEPTH: usize = 64;

/// 选择树中的一个节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// 发送端的绝对源路径
    pub path: PathBuf,
    /// 基本名，兄弟节点间唯一
    pub name: String,
    /// 父节点相对传输根的路径，顶层为 "."
    pub dir: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    File {
        size: u64,
    },
    Directory {
        #[serde(default)]
        items: BTreeMap<String, ManifestNode>,
    },
}

impl ManifestNode {
    pub fn file(path: impl Into<PathBuf>, name: &str, dir: &str, size: u64) -> Self {
        Self {
            path: path.into(),
            name: name.to_string(),
            dir: dir.to_string(),
            kind: NodeKind::File { size },
        }
    }

    pub fn directory(path: impl Into<PathBuf>, name: &str, dir: &str) -> Self {
        Self {
            path: path.into(),
            name: name.to_string(),
            dir: dir.to_string(),
            kind: NodeKind::Directory {
                items: BTreeMap::new(),
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// 文件大小；目录返回 `None`
    pub fn size(&self) -> Option<u64> {
        match self.kind {
            NodeKind::File { size } => Some(size),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, ManifestNode>> {
        match &self.kind {
            NodeKind::File { .. } => None,
            NodeKind::Directory { items } => Some(items),
        }
    }

    /// 插入子节点，文件节点上调用时忽略
    pub fn insert_child(&mut self, child: ManifestNode) {
        if let NodeKind::Directory { items } = &mut self.kind {
            items.insert(child.name.clone(), child);
        }
    }
}

/// 清单中的一个待传文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile<'a> {
    /// 相对传输根的路径，以 `/` 连接
    pub relative: String,
    pub source: &'a Path,
    pub size: u64,
}

/// 顶层条目名到节点的映射
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestNode>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ManifestNode> {
        self.entries.get(name)
    }

    /// 以节点名为键插入，同名的旧条目被替换
    pub fn insert(&mut self, node: ManifestNode) {
        self.entries.insert(node.name.clone(), node);
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestNode> {
        self.entries.values()
    }

    pub fn total_size(&self) -> u64 {
        self.files()
            .iter()
            .map(|f| f.size)
            .fold(0, u64::saturating_add)
    }

    pub fn file_count(&self) -> usize {
        self.files().len()
    }

    /// 按传输顺序列出所有文件
    pub fn files(&self) -> Vec<ManifestFile<'_>> {
        let mut files = Vec::new();
        self.walk(|relative, node| {
            if let NodeKind::File { size } = node.kind {
                files.push(ManifestFile {
                    relative: relative.to_string(),
                    source: &node.path,
                    size,
                });
            }
        });
        files
    }

    /// 按传输顺序列出所有目录（父目录总在子目录之前）
    pub fn directories(&self) -> Vec<String> {
        let mut dirs = Vec::new();
        self.walk(|relative, node| {
            if node.is_dir() {
                dirs.push(relative.to_string());
            }
        });
        dirs
    }

    /// 深度优先先序遍历
    fn walk<'a>(&'a self, mut visit: impl FnMut(&str, &'a ManifestNode)) {
        let mut stack: Vec<(String, &ManifestNode)> = self
            .entries
            .values()
            .rev()
            .map(|node| (node.name.clone(), node))
            .collect();

        while let Some((relative, node)) = stack.pop() {
            visit(&relative, node);
            if let NodeKind::Directory { items } = &node.kind {
                for child in items.values().rev() {
                    stack.push((format!("{relative}/{}", child.name), child));
                }
            }
        }
    }

    /// 校验来自网络的清单
    ///
    /// 每个名字必须是单一路径分量且与映射键一致，否则接收端可能写到
    /// 目标目录之外。
    pub fn validate(&self) -> Result<()> {
        // (兄弟节点, 这些节点所在的层)
        let mut stack = vec![(&self.entries, 1usize)];
        let mut total: u64 = 0;
        while let Some((items, level)) = stack.pop() {
            for (key, node) in items {
                check_name(key)?;
                if *key != node.name {
                    return Err(TransferError::Protocol(format!(
                        "entry `{key}` carries mismatched name `{}`",
                        node.name
                    )));
                }
                if let NodeKind::File { size } = node.kind {
                    total = total.checked_add(size).ok_or_else(|| {
                        TransferError::Protocol("manifest total size overflows".into())
                    })?;
                }
                if let NodeKind::Directory { items } = &node.kind {
                    if level > MAX_DEPTH {
                        return Err(TransferError::Protocol(format!(
                            "manifest nested deeper than {MAX_DEPTH} levels"
                        )));
                    }
                    stack.push((items, level + 1));
                }
            }
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(TransferError::Protocol(format!(
            "invalid entry name `{name}`"
        )));
    }
    Ok(())
}

/// 把 `/` 连接的相对路径映射到目标根目录下
pub fn destination_path(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(root.to_path_buf(), |path, component| path.join(component))
}

/// 为选中的路径生成快照
///
/// 单个条目的权限或 I/O 错误只会让该条目（或子树）缺席，不会让整批失败。
pub fn snapshot<P: AsRef<Path>>(paths: &[P]) -> Manifest {
    let mut manifest = Manifest::new();

    for path in paths {
        let path = path.as_ref();
        let name = match base_name(path) {
            Ok(name) => name,
            Err(source) => {
                warn!("{}", skip(path, source));
                continue;
            }
        };

        match snapshot_entry(path, &name) {
            Ok(node) => manifest.insert(node),
            Err(err) => warn!("{}", err),
        }
    }

    debug!(
        "Snapshot built: {} entries, {} files, {} bytes",
        manifest.len(),
        manifest.file_count(),
        manifest.total_size()
    );
    manifest
}

fn base_name(path: &Path) -> io::Result<String> {
    let name = match path.file_name() {
        Some(name) => name.to_os_string(),
        None => fs::canonicalize(path)?
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no usable file name"))?
            .to_os_string(),
    };
    name.into_string().map_err(|_| non_utf8_name())
}

/// 正在构建中的目录
struct Frame {
    node: ManifestNode,
    relative: String,
    pending: std::vec::IntoIter<(PathBuf, String)>,
}

/// 用显式栈遍历一个顶层条目
///
/// `visited` 记录已经进入过的目录的规范路径，符号链接成环时第二次进入
/// 会被跳过。
fn snapshot_entry(path: &Path, name: &str) -> Result<ManifestNode> {
    let metadata = fs::metadata(path).map_err(|source| skip(path, source))?;
    if metadata.is_file() {
        return Ok(ManifestNode::file(path, name, ROOT_DIR, metadata.len()));
    }
    if !metadata.is_dir() {
        return Err(skip(path, not_regular()));
    }

    let mut visited = HashSet::new();
    visited.insert(fs::canonicalize(path).map_err(|source| skip(path, source))?);

    let mut stack = vec![Frame {
        node: ManifestNode::directory(path, name, ROOT_DIR),
        relative: name.to_string(),
        pending: read_children(path).map_err(|source| skip(path, source))?,
    }];

    while let Some(mut frame) = stack.pop() {
        let Some((child_path, child_name)) = frame.pending.next() else {
            match stack.last_mut() {
                Some(parent) => parent.node.insert_child(frame.node),
                None => return Ok(frame.node),
            }
            continue;
        };
        // 栈中是祖先目录，当前目录在第 stack.len() + 1 层
        let level = stack.len() + 2;

        let metadata = match fs::metadata(&child_path) {
            Ok(metadata) => metadata,
            Err(source) => {
                warn!("{}", skip(&child_path, source));
                stack.push(frame);
                continue;
            }
        };

        if metadata.is_file() {
            let child =
                ManifestNode::file(&child_path, &child_name, &frame.relative, metadata.len());
            frame.node.insert_child(child);
            stack.push(frame);
            continue;
        }

        let child = if metadata.is_dir() {
            enter_directory(&child_path, &child_name, &frame, level, &mut visited)
        } else {
            warn!("{}", skip(&child_path, not_regular()));
            None
        };
        stack.push(frame);
        stack.extend(child);
    }

    Err(skip(path, io::Error::other("directory walk ended unexpectedly")))
}

/// 尝试进入子目录；不可进入时记录原因并返回 `None`
fn enter_directory(
    child_path: &Path,
    child_name: &str,
    parent: &Frame,
    level: usize,
    visited: &mut HashSet<PathBuf>,
) -> Option<Frame> {
    if level > MAX_DEPTH {
        warn!("Skipping {:?}: deeper than {} levels", child_path, MAX_DEPTH);
        return None;
    }

    let canonical = fs::canonicalize(child_path)
        .map_err(|source| warn!("{}", skip(child_path, source)))
        .ok()?;
    if !visited.insert(canonical) {
        warn!(
            "Skipping {:?}: directory already visited (symlink loop?)",
            child_path
        );
        return None;
    }

    let pending = read_children(child_path)
        .map_err(|source| warn!("{}", skip(child_path, source)))
        .ok()?;

    Some(Frame {
        node: ManifestNode::directory(child_path, child_name, &parent.relative),
        relative: format!("{}/{}", parent.relative, child_name),
        pending,
    })
}

fn read_children(dir: &Path) -> io::Result<std::vec::IntoIter<(PathBuf, String)>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        match entry {
            Ok(entry) => match entry.file_name().into_string() {
                Ok(name) => children.push((entry.path(), name)),
                Err(_) => warn!("{}", skip(&entry.path(), non_utf8_name())),
            },
            Err(err) => debug!("Unreadable entry in {:?}: {}", dir, err),
        }
    }
    children.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(children.into_iter())
}

fn skip(path: &Path, source: io::Error) -> TransferError {
    TransferError::PartialSkip {
        path: path.to_path_buf(),
        source,
    }
}

fn not_regular() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "not a regular file or directory")
}

fn non_utf8_name() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, len: usize) {
        fs::write(path, vec![b'x'; len]).unwrap();
    }

    #[test]
    fn test_snapshot_single_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("doc.txt");
        write(&file, 42);

        let manifest = snapshot(&[&file]);
        let node = manifest.get("doc.txt").unwrap();
        assert_eq!(node.size(), Some(42));
        assert_eq!(node.dir, ROOT_DIR);
        assert_eq!(node.path, file);
        assert!(node.children().is_none());
    }

    #[test]
    fn test_snapshot_directory_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("photos");
        fs::create_dir_all(root.join("2024/summer")).unwrap();
        fs::create_dir(root.join("empty")).unwrap();
        write(&root.join("a.jpg"), 10);
        write(&root.join("2024/b.jpg"), 20);
        write(&root.join("2024/summer/c.jpg"), 30);

        let manifest = snapshot(&[&root]);
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.file_count(), 3);
        assert_eq!(manifest.total_size(), 60);

        let photos = manifest.get("photos").unwrap();
        assert!(photos.is_dir());
        assert!(photos.size().is_none());
        let year = &photos.children().unwrap()["2024"];
        assert_eq!(year.dir, "photos");
        let summer = &year.children().unwrap()["summer"];
        assert_eq!(summer.dir, "photos/2024");
        assert_eq!(summer.children().unwrap()["c.jpg"].size(), Some(30));
        assert!(photos.children().unwrap()["empty"].children().unwrap().is_empty());

        assert_eq!(
            manifest.directories(),
            vec!["photos", "photos/2024", "photos/2024/summer", "photos/empty"]
        );
        let order: Vec<_> = manifest.files().into_iter().map(|f| f.relative).collect();
        assert_eq!(
            order,
            vec!["photos/2024/b.jpg", "photos/2024/summer/c.jpg", "photos/a.jpg"]
        );
    }

    #[test]
    fn test_snapshot_skips_missing_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good.bin");
        write(&good, 5);
        let missing = tmp.path().join("missing.bin");

        let manifest = snapshot(&[&missing, &good]);
        assert_eq!(manifest.len(), 1);
        assert!(manifest.get("good.bin").is_some());
        assert!(manifest.get("missing.bin").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_skips_dangling_symlink_in_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("dir");
        fs::create_dir(&root).unwrap();
        write(&root.join("kept.txt"), 3);
        std::os::unix::fs::symlink(tmp.path().join("nowhere"), root.join("dangling")).unwrap();

        let manifest = snapshot(&[&root]);
        let items = manifest.get("dir").unwrap().children().unwrap();
        assert_eq!(items.len(), 1);
        assert!(items.contains_key("kept.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_terminates_on_symlink_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("loop");
        fs::create_dir_all(root.join("inner")).unwrap();
        write(&root.join("inner/file.txt"), 7);
        std::os::unix::fs::symlink(&root, root.join("inner/back")).unwrap();

        let manifest = snapshot(&[&root]);
        let inner = &manifest.get("loop").unwrap().children().unwrap()["inner"];
        let items = inner.children().unwrap();
        assert!(items.contains_key("file.txt"));
        assert!(!items.contains_key("back"));
        assert_eq!(manifest.total_size(), 7);
    }

    #[test]
    fn test_snapshot_same_name_last_wins() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();
        write(&tmp.path().join("a/same.txt"), 1);
        write(&tmp.path().join("b/same.txt"), 2);

        let manifest = snapshot(&[tmp.path().join("a/same.txt"), tmp.path().join("b/same.txt")]);
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("same.txt").unwrap().size(), Some(2));
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut dir = ManifestNode::directory("/src/docs", "docs", ROOT_DIR);
        dir.insert_child(ManifestNode::file("/src/docs/a.txt", "a.txt", "docs", 4));
        let mut manifest = Manifest::new();
        manifest.insert(dir);

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["docs"]["type"], "directory");
        assert_eq!(json["docs"]["dir"], ".");
        assert_eq!(json["docs"]["items"]["a.txt"]["type"], "file");
        assert_eq!(json["docs"]["items"]["a.txt"]["size"], 4);
        assert!(json["docs"].get("size").is_none());

        let parsed: Manifest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_validate_rejects_traversal_names() {
        let mut manifest = Manifest::new();
        manifest.insert(ManifestNode::file("/x", "..", ROOT_DIR, 1));
        assert!(matches!(
            manifest.validate(),
            Err(TransferError::Protocol(_))
        ));

        let json = r#"{"ok":{"path":"/x","name":"../../etc/passwd","dir":".","type":"file","size":1}}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert!(manifest.validate().is_err());

        let mut nested = ManifestNode::directory("/d", "d", ROOT_DIR);
        nested.insert_child(ManifestNode::file("/d/a", "a/b", "d", 1));
        let mut manifest = Manifest::new();
        manifest.insert(nested);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overflowing_total() {
        let mut manifest = Manifest::new();
        manifest.insert(ManifestNode::file("/a", "a", ROOT_DIR, u64::MAX));
        manifest.insert(ManifestNode::file("/b", "b", ROOT_DIR, 2));

        let err = manifest.validate().unwrap_err();
        assert_eq!(err.to_string(), "protocol error: manifest total size overflows");
        assert_eq!(manifest.total_size(), u64::MAX);
    }

    #[test]
    fn test_validate_accepts_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("tree/sub")).unwrap();
        write(&tmp.path().join("tree/sub/f"), 1);
        assert!(snapshot(&[tmp.path().join("tree")]).validate().is_ok());
    }

    #[test]
    fn test_snapshot_depth_limit_passes_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("a");
        let mut deepest = root.clone();
        for _ in 1..MAX_DEPTH + 6 {
            deepest.push("a");
        }
        fs::create_dir_all(&deepest).unwrap();
        let mut last_kept = root.clone();
        for _ in 1..MAX_DEPTH {
            last_kept.push("a");
        }
        write(&last_kept.join("bottom.txt"), 3);

        let manifest = snapshot(&[&root]);
        let levels = manifest
            .directories()
            .iter()
            .map(|dir| dir.split('/').count())
            .max();
        assert_eq!(levels, Some(MAX_DEPTH));
        assert_eq!(manifest.file_count(), 1);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_excess_depth() {
        let mut node = ManifestNode::directory("/d", "d", ROOT_DIR);
        for _ in 1..=MAX_DEPTH {
            let mut parent = ManifestNode::directory("/d", "d", ROOT_DIR);
            parent.insert_child(node);
            node = parent;
        }
        let mut manifest = Manifest::new();
        manifest.insert(node);
        assert!(matches!(
            manifest.validate(),
            Err(TransferError::Protocol(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_snapshot_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("mixed");
        fs::create_dir(&root).unwrap();
        write(&root.join(OsStr::from_bytes(b"bad\xff")), 1);
        write(&root.join(OsStr::from_bytes(b"bad\xfe")), 2);
        write(&root.join("good.txt"), 3);

        let manifest = snapshot(&[&root]);
        let items = manifest.get("mixed").unwrap().children().unwrap();
        assert_eq!(items.keys().collect::<Vec<_>>(), vec!["good.txt"]);
        assert_eq!(manifest.total_size(), 3);

        let bad_top = tmp.path().join(OsStr::from_bytes(b"top\xff"));
        write(&bad_top, 4);
        assert!(snapshot(&[&bad_top]).is_empty());
    }

    #[test]
    fn test_destination_path() {
        let root = Path::new("/downloads");
        assert_eq!(
            destination_path(root, "photos/2024/b.jpg"),
            PathBuf::from("/downloads/photos/2024/b.jpg")
        );
    }
}
