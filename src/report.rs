//! Reference output sink: assembles the item stream into an in-memory tree,
//! propagating totals to ancestors, and renders a plain-text size report.

use std::collections::HashSet;
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use indu_core::item::{
    adds64, DirSummary, ExtInfo, OutputSink, FF_DIR, FF_ERR, FF_EXCLUDE_MASK, FF_HLNKC,
};

pub struct TreeNode {
    pub name: String,
    pub summary: DirSummary,
    pub total_size: i64,
    pub total_asize: i64,
    pub total_items: u64,
    pub children: Vec<TreeNode>,
}

/// Builds the tree while the scan runs. Children are kept in visit order;
/// presentation decisions like sorting belong to whoever renders the tree.
pub struct TreeSink {
    stack: Vec<TreeNode>,
    root: Option<TreeNode>,
    seen_links: HashSet<(u64, u64)>,
    items: u64,
    progress: bool,
    last_update: Instant,
}

impl TreeSink {
    pub fn new(progress: bool) -> Self {
        TreeSink {
            stack: Vec::new(),
            root: None,
            seen_links: HashSet::new(),
            items: 0,
            progress,
            last_update: Instant::now(),
        }
    }

    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn take_root(&mut self) -> Option<TreeNode> {
        self.root.take()
    }

    fn tick(&mut self) {
        if self.progress && self.last_update.elapsed() >= Duration::from_millis(100) {
            self.last_update = Instant::now();
            eprint!("\r{} items scanned", self.items);
            let _ = std::io::stderr().flush();
        }
    }
}

impl OutputSink for TreeSink {
    fn item(
        &mut self,
        dir: &DirSummary,
        name: &str,
        _ext: Option<&ExtInfo>,
        _nlink: u32,
    ) -> Result<()> {
        self.items += 1;
        self.tick();

        // A hard-linked inode's size counts once, however many names it has.
        let mut size = dir.size;
        let mut asize = dir.asize;
        if dir.flags & FF_HLNKC != 0 && !self.seen_links.insert((dir.dev, dir.ino)) {
            size = 0;
            asize = 0;
        }

        let node = TreeNode {
            name: name.to_string(),
            summary: *dir,
            total_size: size,
            total_asize: asize,
            total_items: 1,
            children: Vec::new(),
        };

        if dir.flags & FF_DIR != 0 {
            self.stack.push(node);
        } else {
            let parent = self
                .stack
                .last_mut()
                .ok_or_else(|| anyhow!("item event outside any directory"))?;
            parent.total_size = adds64(parent.total_size, node.total_size);
            parent.total_asize = adds64(parent.total_asize, node.total_asize);
            parent.total_items += 1;
            parent.children.push(node);
        }
        Ok(())
    }

    fn close_dir(&mut self) -> Result<()> {
        let node = self
            .stack
            .pop()
            .ok_or_else(|| anyhow!("close event without an open directory"))?;
        match self.stack.last_mut() {
            Some(parent) => {
                parent.total_size = adds64(parent.total_size, node.total_size);
                parent.total_asize = adds64(parent.total_asize, node.total_asize);
                parent.total_items += node.total_items;
                parent.children.push(node);
            }
            None => self.root = Some(node),
        }
        Ok(())
    }

    fn finish(&mut self, failed: bool) -> i32 {
        if self.progress {
            eprint!("\r{: <40}\r", "");
            let _ = std::io::stderr().flush();
        }
        i32::from(failed)
    }
}

pub fn print_report<W: Write>(
    out: &mut W,
    root: &TreeNode,
    max_depth: Option<usize>,
    apparent: bool,
) -> Result<()> {
    print_node(out, root, 0, max_depth, apparent)
}

fn print_node<W: Write>(
    out: &mut W,
    node: &TreeNode,
    depth: usize,
    max_depth: Option<usize>,
    apparent: bool,
) -> Result<()> {
    let total = if apparent {
        node.total_asize
    } else {
        node.total_size
    };
    let marker = if node.summary.flags & FF_ERR != 0 {
        '!'
    } else if node.summary.flags & FF_EXCLUDE_MASK != 0 {
        '<'
    } else {
        ' '
    };
    let suffix = if node.summary.flags & FF_DIR != 0 { "/" } else { "" };
    writeln!(
        out,
        "{:>10} {} {}{}{}",
        format_size(total),
        marker,
        "  ".repeat(depth),
        node.name,
        suffix
    )?;
    if max_depth.map_or(true, |max| depth < max) {
        for child in &node.children {
            print_node(out, child, depth + 1, max_depth, apparent)?;
        }
    }
    Ok(())
}

/// Human-readable size with binary prefixes, `xxx.x XiB` style.
pub fn format_size(size: i64) -> String {
    let mut value = size.max(0) as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"] {
        if value < 1000.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    if unit == "B" {
        format!("{:.0} {}", value, unit)
    } else {
        format!("{:.1} {}", value, unit)
    }
}
