//! ISO9660 image serialization with a Joliet supplementary volume
//!
//! The image is laid out in one pass over an in-memory directory tree:
//!
//! | sectors        | contents                                        |
//! |----------------|-------------------------------------------------|
//! | 0-15           | system area (zeros)                             |
//! | 16, 17, 18     | primary descriptor, Joliet descriptor, terminator |
//! | 19..           | path tables (L then M) for primary, then Joliet |
//! | ..             | directory extents, primary tree then Joliet tree |
//! | ..             | file data, shared by both trees                 |
//!
//! The primary tree uses uppercase d-character identifiers; the Joliet tree
//! keeps the original names in UCS-2.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::core::CancelToken;
use crate::error::{DiscError, Result};

/// ISO9660 logical sector size
pub const SECTOR_SIZE: usize = 2048;

/// Largest file a single extent can describe
pub const MAX_EXTENT_BYTES: u64 = u32::MAX as u64;

const SYSTEM_AREA_SECTORS: u64 = 16;
const MAX_PRIMARY_DIR_ID: usize = 31;
const MAX_PRIMARY_FILE_ID: usize = 30;
const MAX_PRIMARY_EXT: usize = 8;
const MAX_JOLIET_ID: usize = 64;
const MAX_JOLIET_EXT: usize = 16;
const FLAG_DIRECTORY: u8 = 0x02;
const APPLICATION_ID: &str = "DISCWRIGHT";

/// A path inside the image, kept as its original-case components
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ImagePath {
    components: Vec<String>,
}

impl ImagePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Build an image path from a path relative to the source root
    pub fn from_relative(relative: &Path) -> Result<Self> {
        let mut components = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => components.push(name.to_string_lossy().into_owned()),
                Component::CurDir => {}
                other => {
                    return Err(DiscError::InvalidArgument(format!(
                        "Path component {:?} cannot appear in an image path",
                        other
                    )));
                }
            }
        }
        Ok(Self { components })
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn parent(&self) -> Option<ImagePath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// The uppercase, `/`-separated projection used by the primary tree
    pub fn primary(&self) -> String {
        if self.is_root() {
            return "/".to_string();
        }
        self.components
            .iter()
            .map(|c| format!("/{}", c.to_uppercase()))
            .collect()
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.primary())
    }
}

#[derive(Debug)]
struct DirNode {
    parent: usize,
    primary_id: String,
    joliet_id: String,
    modified: DateTime<Utc>,
    subdirs: Vec<usize>,
    files: Vec<usize>,
}

#[derive(Debug)]
struct FileNode {
    path: ImagePath,
    primary_id: String,
    joliet_id: String,
    source: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tree {
    Primary,
    Joliet,
}

#[derive(Debug, Clone, Copy)]
enum Child {
    Dir(usize),
    File(usize),
}

/// Sector assignments for one directory tree
struct TreeLayout {
    order: Vec<usize>,
    number: Vec<u16>,
    extent_len: Vec<u32>,
    extent_lba: Vec<u32>,
    path_table_size: u32,
    l_table_lba: u32,
    m_table_lba: u32,
}

/// An ISO9660 + Joliet image under construction
///
/// Directories must be registered before anything is placed inside them.
/// File contents are read from their source paths only when the image is
/// written.
#[derive(Debug)]
pub struct IsoImage {
    volume_label: String,
    created: DateTime<Utc>,
    dirs: Vec<DirNode>,
    files: Vec<FileNode>,
    dir_index: HashMap<ImagePath, usize>,
    file_index: HashSet<ImagePath>,
}

impl IsoImage {
    /// Create an empty image. `volume_label` is expected to be normalized.
    pub fn new(volume_label: &str) -> Self {
        let created = Utc::now();
        let mut dir_index = HashMap::new();
        dir_index.insert(ImagePath::root(), 0);

        Self {
            volume_label: volume_label.to_string(),
            created,
            dirs: vec![DirNode {
                parent: 0,
                primary_id: String::new(),
                joliet_id: String::new(),
                modified: created,
                subdirs: Vec::new(),
                files: Vec::new(),
            }],
            files: Vec::new(),
            dir_index,
            file_index: HashSet::new(),
        }
    }

    pub fn set_creation_time(&mut self, created: DateTime<Utc>) {
        self.created = created;
        self.dirs[0].modified = created;
    }

    pub fn volume_label(&self) -> &str {
        &self.volume_label
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of directories, excluding the root
    pub fn directory_count(&self) -> usize {
        self.dirs.len() - 1
    }

    pub fn total_file_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Uppercase primary paths of all files, in the order they were added
    pub fn file_paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.primary()).collect()
    }

    pub fn contains_directory(&self, path: &ImagePath) -> bool {
        self.dir_index.contains_key(path)
    }

    /// Register a directory. Registering an existing directory is a no-op.
    pub fn add_directory(&mut self, path: &ImagePath, modified: DateTime<Utc>) -> Result<()> {
        if self.dir_index.contains_key(path) {
            return Ok(());
        }
        let parent = self.parent_of(path)?;
        let name = path.file_name().unwrap_or_default();

        let primary_base = sanitize_primary(&name.to_uppercase(), MAX_PRIMARY_DIR_ID);
        let primary_id = disambiguate(&primary_base, MAX_PRIMARY_DIR_ID, |b| b.to_string(), |c| {
            self.primary_taken(parent, c)
        });
        let (joliet_base, _) = split_joliet(name, false);
        let joliet_id = disambiguate(&joliet_base, MAX_JOLIET_ID, |b| b.to_string(), |c| {
            self.joliet_taken(parent, c)
        });

        let index = self.dirs.len();
        self.dirs.push(DirNode {
            parent,
            primary_id,
            joliet_id,
            modified,
            subdirs: Vec::new(),
            files: Vec::new(),
        });
        self.dirs[parent].subdirs.push(index);
        self.dir_index.insert(path.clone(), index);
        Ok(())
    }

    /// Register a file whose contents will be read from `source`
    pub fn add_file(
        &mut self,
        path: &ImagePath,
        source: &Path,
        size: u64,
        modified: DateTime<Utc>,
    ) -> Result<()> {
        if size > MAX_EXTENT_BYTES {
            return Err(DiscError::InvalidArgument(format!(
                "{} is {} bytes; files over {} bytes cannot be stored in an ISO9660 extent",
                source.display(),
                size,
                MAX_EXTENT_BYTES
            )));
        }
        if self.file_index.contains(path) {
            return Err(DiscError::InvalidArgument(format!(
                "{} was already added to the image",
                path
            )));
        }
        let parent = self.parent_of(path)?;
        let name = path.file_name().ok_or_else(|| {
            DiscError::InvalidArgument("The image root is not a file".to_string())
        })?;

        let (base, ext) = split_primary(name);
        let max_base = MAX_PRIMARY_FILE_ID - ext.len();
        let primary_id = disambiguate(
            &base,
            max_base,
            |b| format!("{}.{};1", b, ext),
            |c| self.primary_taken(parent, c),
        );

        let (joliet_base, joliet_ext) = split_joliet(name, true);
        let max_joliet_base = match &joliet_ext {
            Some(ext) => MAX_JOLIET_ID - ext.chars().count() - 1,
            None => MAX_JOLIET_ID,
        };
        let joliet_id = disambiguate(
            &joliet_base,
            max_joliet_base,
            |b| match &joliet_ext {
                Some(ext) => format!("{}.{}", b, ext),
                None => b.to_string(),
            },
            |c| self.joliet_taken(parent, c),
        );

        let index = self.files.len();
        self.files.push(FileNode {
            path: path.clone(),
            primary_id,
            joliet_id,
            source: source.to_path_buf(),
            size,
            modified,
        });
        self.dirs[parent].files.push(index);
        self.file_index.insert(path.clone());
        Ok(())
    }

    fn parent_of(&self, path: &ImagePath) -> Result<usize> {
        let parent = path.parent().ok_or_else(|| {
            DiscError::InvalidArgument("The image root cannot be added".to_string())
        })?;
        self.dir_index.get(&parent).copied().ok_or_else(|| {
            DiscError::InvalidArgument(format!(
                "Parent directory {} must be added before {}",
                parent, path
            ))
        })
    }

    fn primary_taken(&self, dir: usize, candidate: &str) -> bool {
        let node = &self.dirs[dir];
        node.subdirs.iter().any(|&d| self.dirs[d].primary_id == candidate)
            || node.files.iter().any(|&f| self.files[f].primary_id == candidate)
    }

    fn joliet_taken(&self, dir: usize, candidate: &str) -> bool {
        let node = &self.dirs[dir];
        node.subdirs.iter().any(|&d| self.dirs[d].joliet_id == candidate)
            || node.files.iter().any(|&f| self.files[f].joliet_id == candidate)
    }

    fn dir_identifier(&self, tree: Tree, dir: usize) -> Vec<u8> {
        if dir == 0 {
            return vec![0];
        }
        match tree {
            Tree::Primary => self.dirs[dir].primary_id.as_bytes().to_vec(),
            Tree::Joliet => ucs2_be(&self.dirs[dir].joliet_id),
        }
    }

    fn file_identifier(&self, tree: Tree, file: usize) -> Vec<u8> {
        match tree {
            Tree::Primary => self.files[file].primary_id.as_bytes().to_vec(),
            Tree::Joliet => ucs2_be(&self.files[file].joliet_id),
        }
    }

    /// Children of `dir` sorted by identifier, as the format requires
    fn sorted_children(&self, tree: Tree, dir: usize) -> Vec<(Vec<u8>, Child)> {
        let node = &self.dirs[dir];
        let mut children: Vec<(Vec<u8>, Child)> = node
            .subdirs
            .iter()
            .map(|&d| (self.dir_identifier(tree, d), Child::Dir(d)))
            .chain(
                node.files
                    .iter()
                    .map(|&f| (self.file_identifier(tree, f), Child::File(f))),
            )
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    /// Directories in path-table order: by level, then parent, then identifier
    fn path_table_order(&self, tree: Tree) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.dirs.len());
        let mut queue = VecDeque::from([0usize]);
        while let Some(dir) = queue.pop_front() {
            order.push(dir);
            for (_, child) in self.sorted_children(tree, dir) {
                if let Child::Dir(d) = child {
                    queue.push_back(d);
                }
            }
        }
        order
    }

    fn layout_tree(&self, tree: Tree) -> Result<TreeLayout> {
        let order = self.path_table_order(tree);
        if order.len() > u16::MAX as usize {
            return Err(DiscError::InvalidArgument(format!(
                "{} directories exceed the ISO9660 path table limit",
                order.len()
            )));
        }

        let mut number = vec![0u16; self.dirs.len()];
        for (i, &dir) in order.iter().enumerate() {
            number[dir] = (i + 1) as u16;
        }

        let mut extent_len = vec![0u32; self.dirs.len()];
        let mut path_table_size = 0u32;
        for &dir in &order {
            let children = self.sorted_children(tree, dir);
            let lens = [34usize, 34]
                .into_iter()
                .chain(children.iter().map(|(id, _)| record_len(id.len())));
            extent_len[dir] = directory_extent_len(lens);

            let id_len = self.dir_identifier(tree, dir).len() as u32;
            path_table_size += 8 + id_len + (id_len % 2);
        }

        Ok(TreeLayout {
            order,
            number,
            extent_len,
            extent_lba: vec![0u32; self.dirs.len()],
            path_table_size,
            l_table_lba: 0,
            m_table_lba: 0,
        })
    }

    /// Total image size in bytes once written
    pub fn image_size(&self) -> Result<u64> {
        let (_, _, _, total) = self.allocate()?;
        Ok(total as u64 * SECTOR_SIZE as u64)
    }

    fn allocate(&self) -> Result<(TreeLayout, TreeLayout, Vec<u32>, u32)> {
        let mut primary = self.layout_tree(Tree::Primary)?;
        let mut joliet = self.layout_tree(Tree::Joliet)?;

        // Descriptors: primary, supplementary, terminator
        let mut next = SYSTEM_AREA_SECTORS + 3;

        for layout in [&mut primary, &mut joliet] {
            let table_sectors = sectors_for(layout.path_table_size as u64);
            layout.l_table_lba = to_lba(next)?;
            next += table_sectors;
            layout.m_table_lba = to_lba(next)?;
            next += table_sectors;
        }

        for layout in [&mut primary, &mut joliet] {
            for i in 0..layout.order.len() {
                let dir = layout.order[i];
                layout.extent_lba[dir] = to_lba(next)?;
                next += layout.extent_len[dir] as u64 / SECTOR_SIZE as u64;
            }
        }

        let mut file_lba = Vec::with_capacity(self.files.len());
        for file in &self.files {
            file_lba.push(to_lba(next)?);
            next += sectors_for(file.size);
        }

        Ok((primary, joliet, file_lba, to_lba(next)?))
    }

    /// Serialize the image, reading file contents from their sources
    ///
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, out: &mut W, cancel: &CancelToken) -> Result<u64> {
        let (primary, joliet, file_lba, total_sectors) = self.allocate()?;
        let mut written = 0u64;

        written += write_zeros(out, SYSTEM_AREA_SECTORS * SECTOR_SIZE as u64)?;
        for (tree, layout) in [(Tree::Primary, &primary), (Tree::Joliet, &joliet)] {
            let descriptor = self.volume_descriptor(tree, layout, total_sectors);
            out.write_all(&descriptor)?;
            written += descriptor.len() as u64;
        }
        let terminator = terminator_descriptor();
        out.write_all(&terminator)?;
        written += terminator.len() as u64;

        for (tree, layout) in [(Tree::Primary, &primary), (Tree::Joliet, &joliet)] {
            for big_endian in [false, true] {
                let table = self.path_table(tree, layout, big_endian);
                out.write_all(&table)?;
                written += table.len() as u64;
                written += pad_to_sector(out, table.len() as u64)?;
            }
        }

        for (tree, layout) in [(Tree::Primary, &primary), (Tree::Joliet, &joliet)] {
            for &dir in &layout.order {
                let extent = self.directory_extent(tree, layout, dir, &file_lba);
                out.write_all(&extent)?;
                written += extent.len() as u64;
            }
        }

        for file in &self.files {
            cancel.check()?;
            let source =
                File::open(&file.source).map_err(|e| DiscError::from_io_at(e, &file.source))?;
            let copied = io::copy(&mut source.take(file.size), out)?;
            if copied < file.size {
                log::warn!(
                    "{} shrank during the build; padding {} bytes",
                    file.source.display(),
                    file.size - copied
                );
                write_zeros(out, file.size - copied)?;
            }
            written += file.size;
            written += pad_to_sector(out, file.size)?;
        }

        out.flush()?;
        debug_assert_eq!(written, total_sectors as u64 * SECTOR_SIZE as u64);
        Ok(written)
    }

    fn dir_record(&self, layout: &TreeLayout, dir: usize, id: &[u8]) -> Vec<u8> {
        directory_record(
            id,
            layout.extent_lba[dir],
            layout.extent_len[dir],
            FLAG_DIRECTORY,
            &self.dirs[dir].modified,
        )
    }

    fn directory_extent(
        &self,
        tree: Tree,
        layout: &TreeLayout,
        dir: usize,
        file_lba: &[u32],
    ) -> Vec<u8> {
        let mut records = vec![
            self.dir_record(layout, dir, &[0]),
            self.dir_record(layout, self.dirs[dir].parent, &[1]),
        ];
        for (id, child) in self.sorted_children(tree, dir) {
            let record = match child {
                Child::Dir(d) => self.dir_record(layout, d, &id),
                Child::File(f) => {
                    let file = &self.files[f];
                    directory_record(&id, file_lba[f], file.size as u32, 0, &file.modified)
                }
            };
            records.push(record);
        }

        let mut extent = vec![0u8; layout.extent_len[dir] as usize];
        let mut pos = 0usize;
        for record in records {
            if pos % SECTOR_SIZE + record.len() > SECTOR_SIZE {
                pos += SECTOR_SIZE - pos % SECTOR_SIZE;
            }
            extent[pos..pos + record.len()].copy_from_slice(&record);
            pos += record.len();
        }
        extent
    }

    fn path_table(&self, tree: Tree, layout: &TreeLayout, big_endian: bool) -> Vec<u8> {
        let mut table = Vec::with_capacity(layout.path_table_size as usize);
        for &dir in &layout.order {
            let id = self.dir_identifier(tree, dir);
            let parent_number = layout.number[self.dirs[dir].parent];
            let lba = layout.extent_lba[dir];

            table.push(id.len() as u8);
            table.push(0);
            if big_endian {
                table.extend_from_slice(&lba.to_be_bytes());
                table.extend_from_slice(&parent_number.to_be_bytes());
            } else {
                table.extend_from_slice(&lba.to_le_bytes());
                table.extend_from_slice(&parent_number.to_le_bytes());
            }
            table.extend_from_slice(&id);
            if id.len() % 2 == 1 {
                table.push(0);
            }
        }
        table
    }

    fn volume_descriptor(&self, tree: Tree, layout: &TreeLayout, total_sectors: u32) -> Vec<u8> {
        let mut vd = vec![0u8; SECTOR_SIZE];
        vd[0] = match tree {
            Tree::Primary => 1,
            Tree::Joliet => 2,
        };
        vd[1..6].copy_from_slice(b"CD001");
        vd[6] = 1;

        fill_text(&mut vd[8..40], "", tree);
        let label = match tree {
            Tree::Primary => self.volume_label.clone(),
            Tree::Joliet => self.volume_label.chars().take(16).collect(),
        };
        fill_text(&mut vd[40..72], &label, tree);
        vd[80..88].copy_from_slice(&both_u32(total_sectors));
        if tree == Tree::Joliet {
            // UCS-2 level 3
            vd[88..91].copy_from_slice(b"%/E");
        }
        vd[120..124].copy_from_slice(&both_u16(1));
        vd[124..128].copy_from_slice(&both_u16(1));
        vd[128..132].copy_from_slice(&both_u16(SECTOR_SIZE as u16));
        vd[132..140].copy_from_slice(&both_u32(layout.path_table_size));
        vd[140..144].copy_from_slice(&layout.l_table_lba.to_le_bytes());
        vd[148..152].copy_from_slice(&layout.m_table_lba.to_be_bytes());

        let root = self.dir_record(layout, 0, &[0]);
        vd[156..156 + root.len()].copy_from_slice(&root);

        fill_text(&mut vd[190..318], "", tree);
        fill_text(&mut vd[318..446], "", tree);
        fill_text(&mut vd[446..574], "", tree);
        fill_text(&mut vd[574..702], APPLICATION_ID, tree);
        fill_text(&mut vd[702..739], "", tree);
        fill_text(&mut vd[739..776], "", tree);
        fill_text(&mut vd[776..813], "", tree);

        let created = descriptor_date(Some(&self.created));
        vd[813..830].copy_from_slice(&created);
        vd[830..847].copy_from_slice(&created);
        vd[847..864].copy_from_slice(&descriptor_date(None));
        vd[864..881].copy_from_slice(&created);
        vd[881] = 1;
        vd
    }
}

fn terminator_descriptor() -> Vec<u8> {
    let mut vd = vec![0u8; SECTOR_SIZE];
    vd[0] = 255;
    vd[1..6].copy_from_slice(b"CD001");
    vd[6] = 1;
    vd
}

fn record_len(id_len: usize) -> usize {
    33 + id_len + (1 - id_len % 2)
}

fn directory_record(
    id: &[u8],
    lba: u32,
    data_len: u32,
    flags: u8,
    modified: &DateTime<Utc>,
) -> Vec<u8> {
    let len = record_len(id.len());
    let mut record = vec![0u8; len];
    record[0] = len as u8;
    record[2..10].copy_from_slice(&both_u32(lba));
    record[10..18].copy_from_slice(&both_u32(data_len));
    record[18..25].copy_from_slice(&recording_date(modified));
    record[25] = flags;
    record[28..32].copy_from_slice(&both_u16(1));
    record[32] = id.len() as u8;
    record[33..33 + id.len()].copy_from_slice(id);
    record
}

fn directory_extent_len(record_lens: impl Iterator<Item = usize>) -> u32 {
    let mut sectors = 1u32;
    let mut used = 0usize;
    for len in record_lens {
        if used + len > SECTOR_SIZE {
            sectors += 1;
            used = 0;
        }
        used += len;
    }
    sectors * SECTOR_SIZE as u32
}

fn sectors_for(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE as u64)
}

fn to_lba(sector: u64) -> Result<u32> {
    u32::try_from(sector).map_err(|_| {
        DiscError::InvalidArgument("Image exceeds the ISO9660 sector address space".to_string())
    })
}

fn both_u16(value: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..2].copy_from_slice(&value.to_le_bytes());
    out[2..].copy_from_slice(&value.to_be_bytes());
    out
}

fn both_u32(value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..].copy_from_slice(&value.to_be_bytes());
    out
}

fn recording_date(ts: &DateTime<Utc>) -> [u8; 7] {
    [
        (ts.year() - 1900).clamp(0, 255) as u8,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        0,
    ]
}

/// 17-byte descriptor date; `None` gives the "not specified" value
fn descriptor_date(ts: Option<&DateTime<Utc>>) -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    if let Some(ts) = ts {
        let text = format!("{}00", ts.format("%Y%m%d%H%M%S"));
        out[..16].copy_from_slice(&text.as_bytes()[..16]);
    }
    out
}

fn fill_text(field: &mut [u8], text: &str, tree: Tree) {
    match tree {
        Tree::Primary => {
            field.fill(b' ');
            let bytes = text.as_bytes();
            let n = bytes.len().min(field.len());
            field[..n].copy_from_slice(&bytes[..n]);
        }
        Tree::Joliet => {
            let mut encoded = ucs2_be(text);
            encoded.truncate(field.len() - field.len() % 2);
            for pair in field.chunks_mut(2) {
                if pair.len() == 2 {
                    pair.copy_from_slice(&[0x00, 0x20]);
                } else {
                    pair[0] = 0;
                }
            }
            field[..encoded.len()].copy_from_slice(&encoded);
        }
    }
}

fn ucs2_be(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

/// Map to d-characters (`A-Z`, `0-9`, `_`); input is expected uppercase
fn sanitize_primary(text: &str, max: usize) -> String {
    let mut out: String = text
        .chars()
        .map(|c| match c {
            'A'..='Z' | '0'..='9' | '_' => c,
            _ => '_',
        })
        .take(max)
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

fn split_primary(name: &str) -> (String, String) {
    let upper = name.to_uppercase();
    let (base, ext) = match upper.rfind('.') {
        Some(i) if i > 0 => (&upper[..i], &upper[i + 1..]),
        _ => (upper.as_str(), ""),
    };
    let ext: String = if ext.is_empty() {
        String::new()
    } else {
        sanitize_primary(ext, MAX_PRIMARY_EXT)
    };
    let base = sanitize_primary(base, MAX_PRIMARY_FILE_ID - ext.len());
    (base, ext)
}

fn sanitize_joliet(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '*' | '/' | ':' | ';' | '?' | '\\' => '_',
            c if c.is_control() || c.len_utf16() > 1 => '_',
            c => c,
        })
        .collect()
}

/// Split a Joliet name into base and (for files) extension
fn split_joliet(name: &str, is_file: bool) -> (String, Option<String>) {
    let clean = sanitize_joliet(name);
    if is_file && let Some(i) = clean.rfind('.') && i > 0 && i + 1 < clean.len() {
        let ext: String = clean[i + 1..].chars().take(MAX_JOLIET_EXT).collect();
        let max_base = MAX_JOLIET_ID - ext.chars().count() - 1;
        let base: String = clean[..i].chars().take(max_base).collect();
        return (base, Some(ext));
    }
    (clean.chars().take(MAX_JOLIET_ID).collect(), None)
}

/// Render `base`, appending `~N` to it until `taken` rejects no candidate
fn disambiguate(
    base: &str,
    max_base: usize,
    render: impl Fn(&str) -> String,
    taken: impl Fn(&str) -> bool,
) -> String {
    let first = render(base);
    if !taken(&first) {
        return first;
    }

    let mut n = 1u32;
    loop {
        let suffix = format!("~{}", n);
        let keep = max_base.saturating_sub(suffix.len());
        let trimmed: String = base.chars().take(keep).collect();
        let candidate = render(&format!("{}{}", trimmed, suffix));
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn write_zeros<W: Write>(out: &mut W, mut count: u64) -> Result<u64> {
    let zeros = [0u8; SECTOR_SIZE];
    let total = count;
    while count > 0 {
        let n = count.min(SECTOR_SIZE as u64) as usize;
        out.write_all(&zeros[..n])?;
        count -= n as u64;
    }
    Ok(total)
}

fn pad_to_sector<W: Write>(out: &mut W, len: u64) -> Result<u64> {
    let rem = len % SECTOR_SIZE as u64;
    if rem == 0 {
        return Ok(0);
    }
    write_zeros(out, SECTOR_SIZE as u64 - rem)
}
