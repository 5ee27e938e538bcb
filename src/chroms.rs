use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};

/// Chromosome name <-> integer id table.
///
/// The store only ever sees integer ids; this map is what the command line
/// tools use to translate the names found in aligner output and region files.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ChromosomeMap {
    name_to_id: FxHashMap<String, i32>,
    id_to_name: FxHashMap<i32, String>,
    next_id: i32,
}

impl ChromosomeMap {
    pub fn new() -> Self {
        ChromosomeMap {
            name_to_id: FxHashMap::default(),
            id_to_name: FxHashMap::default(),
            next_id: 1,
        }
    }

    /// Load a two column `name<TAB>id` file. Blank lines and `#` comments are skipped.
    pub fn from_file(path: &str) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut map = ChromosomeMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let (name, id) = match (fields.next(), fields.next()) {
                (Some(name), Some(id)) => (name, id),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Line {}: expected `name<TAB>id`", line_no + 1),
                    ))
                }
            };
            let id = id.trim().parse::<i32>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Line {}: invalid chromosome id '{}': {}", line_no + 1, id, e),
                )
            })?;
            map.insert(name, id);
        }
        Ok(map)
    }

    pub fn insert(&mut self, name: &str, id: i32) {
        self.name_to_id.insert(name.to_owned(), id);
        self.id_to_name.insert(id, name.to_owned());
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }

    pub fn get_or_insert_id(&mut self, name: &str) -> i32 {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.next_id;
        self.insert(name, id);
        id
    }

    pub fn get_id(&self, name: &str) -> Option<i32> {
        self.name_to_id.get(name).copied()
    }

    pub fn get_name(&self, id: i32) -> Option<&str> {
        self.id_to_name.get(&id).map(|s| s.as_str())
    }

    /// Name for output: the mapped name if known, the bare id otherwise.
    pub fn display_name(&self, id: i32) -> String {
        match self.get_name(id) {
            Some(name) => name.to_string(),
            None => id.to_string(),
        }
    }

    /// Map lookup first, then `12` or `chr12` style numeric names.
    pub fn resolve(&self, name: &str) -> Option<i32> {
        if let Some(id) = self.get_id(name) {
            return Some(id);
        }
        let bare = name.strip_prefix("chr").unwrap_or(name);
        bare.parse::<i32>().ok().filter(|id| *id >= 0)
    }

    pub fn len(&self) -> usize {
        self.name_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.name_to_id.is_empty()
    }

    /// Names in natural order (chr2 before chr10).
    pub fn names_sorted(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.name_to_id.keys().map(|s| s.as_str()).collect();
        names.sort_by(|a, b| natord::compare(a, b));
        names
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for name in self.names_sorted() {
            writeln!(writer, "{}\t{}", name, self.name_to_id[name])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut map = ChromosomeMap::new();
        let a = map.get_or_insert_id("chrX");
        let b = map.get_or_insert_id("chr2");
        assert_ne!(a, b);
        assert_eq!(map.get_or_insert_id("chrX"), a);
        assert_eq!(map.get_name(b), Some("chr2"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_resolve_numeric_fallback() {
        let mut map = ChromosomeMap::new();
        map.insert("chrM", 25);
        assert_eq!(map.resolve("chrM"), Some(25));
        assert_eq!(map.resolve("chr7"), Some(7));
        assert_eq!(map.resolve("12"), Some(12));
        assert_eq!(map.resolve("chrUn_gl000220"), None);
    }

    #[test]
    fn test_from_reader_and_natural_order() {
        let text = "# genome\nchr10\t10\nchr2\t2\n\nchr1\t1\n";
        let map = ChromosomeMap::from_reader(text.as_bytes()).unwrap();
        assert_eq!(map.names_sorted(), vec!["chr1", "chr2", "chr10"]);
        // explicit ids push the counter past them
        let mut map = map;
        assert_eq!(map.get_or_insert_id("chrY"), 11);
    }

    #[test]
    fn test_from_reader_rejects_bad_id() {
        let text = "chr1\tone\n";
        assert!(ChromosomeMap::from_reader(text.as_bytes()).is_err());
    }
}
