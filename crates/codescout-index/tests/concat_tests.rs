use std::path::Path;

use anyhow::Result;
use codescout_index::concat::concat_n;
use codescout_index::walk::DefaultIgnorePolicy;
use codescout_index::{Index, IndexWriter};

fn build(root: &Path, out: &Path) -> Result<()> {
    let mut w = IndexWriter::create(out)?;
    let policy = DefaultIgnorePolicy::default();
    w.add_dir(root, root, &policy, |_, _| {}, |_, _| {})?;
    w.flush()
}

fn build_one(dir: &Path, name: &str, content: &str, out: &Path) -> Result<()> {
    let src = dir.join(format!("src-{}", name));
    std::fs::create_dir(&src)?;
    std::fs::write(src.join(name), content)?;
    build(&src, out)
}

#[test]
fn two_way_merge_rebases_docids() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let i1 = dir.path().join("i1.idx");
    let i2 = dir.path().join("i2.idx");
    build_one(dir.path(), "x", "abcd", &i1)?;
    build_one(dir.path(), "y", "bcde", &i2)?;

    let merged_path = dir.path().join("full.idx");
    concat_n(&merged_path, &[&i1, &i2])?;

    let merged = Index::open(&merged_path)?;
    assert_eq!(merged.doc_count(), 2);
    assert_eq!(merged.posting_list(*b"bcd")?, vec![0, 1]);
    assert_eq!(merged.posting_list(*b"abc")?, vec![0]);
    assert_eq!(merged.posting_list(*b"cde")?, vec![1]);
    assert_eq!(merged.resolve(0)?, "x");
    assert_eq!(merged.resolve(1)?, "y");
    // Positional blocks are rebased too.
    assert_eq!(merged.positional_for_doc(*b"bcd", 0)?, vec![1]);
    assert_eq!(merged.positional_for_doc(*b"bcd", 1)?, vec![0]);
    Ok(())
}

#[test]
fn single_input_merge_reserializes_identically() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    std::fs::create_dir(&src)?;
    std::fs::write(src.join("a.txt"), "the quick brown fox")?;
    std::fs::write(src.join("b.txt"), "jumps over the lazy dog")?;
    let idx = dir.path().join("pkg.idx");
    build(&src, &idx)?;

    let merged = dir.path().join("merged.idx");
    concat_n(&merged, &[&idx])?;
    assert_eq!(std::fs::read(&idx)?, std::fs::read(&merged)?);
    Ok(())
}

#[test]
fn merge_equals_combined_build() -> Result<()> {
    let dir = tempfile::tempdir()?;

    // Two separate package trees...
    let p1 = dir.path().join("p1");
    let p2 = dir.path().join("p2");
    std::fs::create_dir_all(p1.join("pkg-a"))?;
    std::fs::create_dir_all(p2.join("pkg-b"))?;
    std::fs::write(p1.join("pkg-a/main.c"), "int main() { return 7; }")?;
    std::fs::write(p2.join("pkg-b/util.c"), "static int util(void);")?;

    let i1 = dir.path().join("i1.idx");
    let i2 = dir.path().join("i2.idx");
    build(&p1, &i1)?;
    build(&p2, &i2)?;
    let merged_path = dir.path().join("full.idx");
    concat_n(&merged_path, &[&i1, &i2])?;
    let merged = Index::open(&merged_path)?;

    // ...and the same trees indexed as one.
    let combined = dir.path().join("combined");
    std::fs::create_dir_all(combined.join("pkg-a"))?;
    std::fs::create_dir_all(combined.join("pkg-b"))?;
    std::fs::write(combined.join("pkg-a/main.c"), "int main() { return 7; }")?;
    std::fs::write(combined.join("pkg-b/util.c"), "static int util(void);")?;
    let full = dir.path().join("direct.idx");
    build(&combined, &full)?;
    let direct = Index::open(&full)?;

    assert_eq!(merged.doc_count(), direct.doc_count());
    for d in 0..merged.doc_count() {
        assert_eq!(merged.resolve(d)?, direct.resolve(d)?);
    }
    let entries: Vec<_> = merged.directory().collect();
    assert_eq!(entries.len(), direct.directory().count());
    for e in entries {
        let tri = [
            (e.trigram >> 16) as u8,
            (e.trigram >> 8) as u8,
            e.trigram as u8,
        ];
        assert_eq!(merged.posting_list(tri)?, direct.posting_list(tri)?);
        assert_eq!(merged.positional_list(tri)?, direct.positional_list(tri)?);
    }
    Ok(())
}

#[test]
fn merge_with_no_inputs_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("full.idx");
    let inputs: Vec<&Path> = vec![];
    assert!(concat_n(&out, &inputs).is_err());
}
