//! Jar and zip packaging.
//!
//! Entry names are the sources' project-relative paths and entry timestamps
//! their modification times, so repeated packaging of unchanged inputs
//! produces identical archives.

use crate::{
    error::{IoResultExt, KilnError, Result},
    filter::NameFilter,
    paths::ProjectPath,
    utils,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";

/// A standard name-value manifest with named sections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub main: BTreeMap<String, String>,
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Manifest {
    pub fn new() -> Self {
        let mut main = BTreeMap::new();
        main.insert("Manifest-Version".to_string(), "1.0".to_string());
        Manifest { main, sections: BTreeMap::new() }
    }

    pub fn with_main_class(main_class: &str) -> Self {
        let mut manifest = Manifest::new();
        manifest.main.insert("Main-Class".to_string(), main_class.to_string());
        manifest
    }

    /// Merges `other` into `self`: main attributes are overlaid, and each of
    /// `other`'s sections merges attribute-by-attribute into the section of
    /// the same name.
    pub fn merge(&mut self, other: &Manifest) {
        for (name, value) in &other.main {
            self.main.insert(name.clone(), value.clone());
        }
        for (section, attributes) in &other.sections {
            let target = self.sections.entry(section.clone()).or_default();
            for (name, value) in attributes {
                target.insert(name.clone(), value.clone());
            }
        }
    }

    pub fn parse(text: &str) -> Result<Manifest> {
        let mut manifest = Manifest::default();
        let mut current: Option<String> = None;
        let mut last_name: Option<String> = None;
        for raw in text.lines() {
            if raw.is_empty() {
                current = None;
                last_name = None;
                continue;
            }
            if let Some(continuation) = raw.strip_prefix(' ') {
                let Some(name) = &last_name else {
                    return Err(KilnError::msg("manifest continuation without attribute"));
                };
                let attributes = match &current {
                    Some(section) => manifest.sections.entry(section.clone()).or_default(),
                    None => &mut manifest.main,
                };
                if let Some(value) = attributes.get_mut(name) {
                    value.push_str(continuation);
                }
                continue;
            }
            let Some((name, value)) = raw.split_once(": ") else {
                return Err(KilnError::msg(format!("malformed manifest line: {raw:?}")));
            };
            if name == "Name" {
                current = Some(value.to_string());
                last_name = None;
                continue;
            }
            let attributes = match &current {
                Some(section) => manifest.sections.entry(section.clone()).or_default(),
                None => &mut manifest.main,
            };
            attributes.insert(name.to_string(), value.to_string());
            last_name = Some(name.to_string());
        }
        Ok(manifest)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Manifest-Version leads the main section
        if let Some(version) = self.main.get("Manifest-Version") {
            push_attribute(&mut out, "Manifest-Version", version);
        }
        for (name, value) in &self.main {
            if name != "Manifest-Version" {
                push_attribute(&mut out, name, value);
            }
        }
        for (section, attributes) in &self.sections {
            out.push('\n');
            push_attribute(&mut out, "Name", section);
            for (name, value) in attributes {
                push_attribute(&mut out, name, value);
            }
        }
        out.push('\n');
        out
    }
}

// 72-byte lines with space-led continuations, per the jar manifest format
fn push_attribute(out: &mut String, name: &str, value: &str) {
    let line = format!("{name}: {value}");
    let mut bytes = line.as_bytes();
    let mut first = true;
    while !bytes.is_empty() {
        let budget = if first { 72 } else { 71 };
        let take = bytes.len().min(budget);
        // back off to a character boundary
        let mut take = take;
        while take < bytes.len() && !line.is_char_boundary(line.len() - bytes.len() + take) {
            take -= 1;
        }
        if !first {
            out.push(' ');
        }
        out.push_str(std::str::from_utf8(&bytes[..take]).unwrap_or(""));
        out.push('\n');
        bytes = &bytes[take..];
        first = false;
    }
}

/// Writes the sources into `output`. With a manifest this is a jar (the
/// manifest becomes the first entry); without one, a plain zip. Directories
/// among the sources contribute their descendents when `recursive` is set.
pub fn archive(
    sources: &[ProjectPath],
    output: &Path,
    manifest: Option<&Manifest>,
    recursive: bool,
) -> Result<()> {
    utils::create_parent_dir_all(output)?;
    let file = fs::File::create(output).err_path(output)?;
    let mut writer = ZipWriter::new(file);
    let zip_err = |err: zip::result::ZipError| {
        KilnError::msg(format!("error writing {}: {err}", output.display()))
    };

    if let Some(manifest) = manifest {
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        writer.start_file(MANIFEST_NAME, options).map_err(zip_err)?;
        writer.write_all(manifest.render().as_bytes()).err_path(output)?;
    }

    let mut written = BTreeSet::new();
    for source in sources {
        add_entry(&mut writer, source, &mut written, output)?;
        if recursive && source.is_directory() {
            for entry in WalkDir::new(source.as_file())
                .follow_links(true)
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|entry| entry.depth() > 0)
            {
                let Some(relative) = utils::relativize(source.as_file(), entry.path()) else {
                    continue;
                };
                let Ok(nested) = source.resolve(&relative) else { continue };
                add_entry(&mut writer, &nested, &mut written, output)?;
            }
        }
    }
    writer.finish().map_err(zip_err)?;
    Ok(())
}

fn add_entry<W: Write + std::io::Seek>(
    writer: &mut ZipWriter<W>,
    source: &ProjectPath,
    written: &mut BTreeSet<String>,
    output: &Path,
) -> Result<()> {
    let relative = source.relative_path();
    let name = relative
        .iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if name.is_empty() || !written.insert(name.clone()) {
        return Ok(());
    }
    let zip_err = |err: zip::result::ZipError| {
        KilnError::msg(format!("error writing {}: {err}", output.display()))
    };
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(to_zip_datetime(source.last_modified()));
    if source.is_directory() {
        writer.add_directory(name, options).map_err(zip_err)?;
    } else {
        writer.start_file(name, options).map_err(zip_err)?;
        let content = utils::read_bytes(source.as_file())?;
        writer.write_all(&content).err_path(output)?;
    }
    Ok(())
}

/// Extracts entries whose names match `filter` into `dest_dir`, restoring
/// directory structure and per-entry modification times. Returns the set of
/// destination paths written.
pub fn unzip(input: &Path, dest_dir: &Path, filter: &NameFilter) -> Result<BTreeSet<PathBuf>> {
    let file = fs::File::open(input).err_path(input)?;
    let mut zip = ZipArchive::new(file)
        .map_err(|err| KilnError::msg(format!("error reading {}: {err}", input.display())))?;
    let mut extracted = BTreeSet::new();
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| KilnError::msg(format!("error reading {}: {err}", input.display())))?;
        let name = entry.name().to_string();
        if !filter.accepts(&name) {
            continue;
        }
        let Some(safe) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(KilnError::msg(format!("refusing to extract unsafe entry {name:?}")));
        };
        let dest = dest_dir.join(safe);
        if entry.is_dir() {
            fs::create_dir_all(&dest).err_path(&dest)?;
        } else {
            utils::create_parent_dir_all(&dest)?;
            let mut content = Vec::new();
            entry.read_to_end(&mut content).err_path(&dest)?;
            utils::write_bytes(&dest, &content)?;
            let opened = fs::OpenOptions::new().write(true).open(&dest).err_path(&dest)?;
            opened.set_modified(from_zip_datetime(entry.last_modified())).err_path(&dest)?;
        }
        extracted.insert(dest);
    }
    Ok(extracted)
}

fn to_zip_datetime(mtime_ms: u64) -> zip::DateTime {
    let secs = mtime_ms / 1000;
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    if !(1980..=2107).contains(&year) {
        return zip::DateTime::default();
    }
    zip::DateTime::from_date_and_time(
        year as u16,
        month as u8,
        day as u8,
        (rem / 3600) as u8,
        ((rem % 3600) / 60) as u8,
        (rem % 60) as u8,
    )
    .unwrap_or_default()
}

fn from_zip_datetime(datetime: zip::DateTime) -> SystemTime {
    let days = days_from_civil(
        i64::from(datetime.year()),
        u32::from(datetime.month()),
        u32::from(datetime.day()),
    );
    let secs = days * 86_400
        + i64::from(datetime.hour()) * 3600
        + i64::from(datetime.minute()) * 60
        + i64::from(datetime.second());
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

// civil <-> epoch-day conversions (proleptic Gregorian)
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = if year >= 0 { year } else { year - 399 } / 400;
    let yoe = year - era * 400;
    let mp = i64::from(if month > 2 { month - 3 } else { month + 9 });
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn civil_conversions_round_trip() {
        for days in [0i64, 3_652, 18_262, 20_000] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days);
        }
        assert_eq!(civil_from_days(0), (1970, 1, 1));
    }

    #[test]
    fn manifest_render_and_parse_round_trip() {
        let mut manifest = Manifest::new();
        manifest.main.insert("Main-Class".into(), "example.App".into());
        manifest
            .sections
            .entry("example/".into())
            .or_default()
            .insert("Sealed".into(), "true".into());

        let rendered = manifest.render();
        assert!(rendered.starts_with("Manifest-Version: 1.0\n"));
        let parsed = Manifest::parse(&rendered).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn manifest_merge_is_per_section() {
        let mut base = Manifest::new();
        base.sections.entry("a/".into()).or_default().insert("X".into(), "1".into());

        let mut extra = Manifest::default();
        extra.sections.entry("a/".into()).or_default().insert("Y".into(), "2".into());
        extra.main.insert("Built-By".into(), "kiln".into());

        base.merge(&extra);
        assert_eq!(base.main.get("Built-By").map(String::as_str), Some("kiln"));
        let section = &base.sections["a/"];
        assert_eq!(section.len(), 2);
    }

    #[test]
    fn archive_and_unzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("classes/example")).unwrap();
        fs::write(dir.path().join("classes/example/A.class"), b"bytecode").unwrap();

        let base = ProjectPath::root(dir.path()).join("classes").unwrap().as_base();
        let class = base.join("example").unwrap().join("A.class").unwrap();

        let jar = dir.path().join("out.jar");
        archive(&[class], &jar, Some(&Manifest::new()), false).unwrap();

        let dest = dir.path().join("unpacked");
        let extracted = unzip(&jar, &dest, &NameFilter::All).unwrap();
        assert!(extracted.contains(&dest.join("example/A.class")));
        assert!(dest.join(MANIFEST_NAME).exists());
        assert_eq!(fs::read(dest.join("example/A.class")).unwrap(), b"bytecode");
    }

    #[test]
    fn unzip_honors_name_filter() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.class"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let root = ProjectPath::root(dir.path()).as_base();
        let sources = [root.join("a.class").unwrap(), root.join("b.txt").unwrap()];
        let archive_path = dir.path().join("out.zip");
        archive(&sources, &archive_path, None, false).unwrap();

        let dest = dir.path().join("unpacked");
        let extracted =
            unzip(&archive_path, &dest, &NameFilter::glob("*.class").unwrap()).unwrap();
        assert_eq!(extracted.len(), 1);
        assert!(dest.join("a.class").exists());
        assert!(!dest.join("b.txt").exists());
    }
}
