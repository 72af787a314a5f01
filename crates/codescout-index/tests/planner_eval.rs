use std::path::Path;

use anyhow::Result;
use codescout_index::query::{regexp_query, QueryOp};
use codescout_index::walk::DefaultIgnorePolicy;
use codescout_index::{Index, IndexWriter};

const DOCS: &[(&str, &str)] = &[
    ("quick.txt", "the quick foobar jumps over everything"),
    ("pets.txt", "a cat sits next to a dog"),
    ("dog.txt", "dog only in this one"),
    ("plain.txt", "nothing of interest whatsoever"),
    ("split.txt", "foo and bar but never joined"),
    ("abx.txt", "aXb aYb azb patterns"),
];

fn build_corpus(dir: &Path) -> Result<Index> {
    let src = dir.join("src");
    std::fs::create_dir(&src)?;
    for (name, content) in DOCS {
        std::fs::write(src.join(name), content)?;
    }
    let idx_path = dir.join("corpus.idx");
    let mut w = IndexWriter::create(&idx_path)?;
    let policy = DefaultIgnorePolicy::default();
    w.add_dir(&src, &src, &policy, |_, _| {}, |_, _| {})?;
    w.flush()?;
    Index::open(&idx_path)
}

#[test]
fn literal_candidates_are_the_trigram_intersection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ix = build_corpus(dir.path())?;

    let q = regexp_query("foobar")?;
    let candidates = ix.posting_query(&q)?;

    let mut expect = ix.posting_list(*b"foo")?;
    for tri in [*b"oob", *b"oba", *b"bar"] {
        let l = ix.posting_list(tri)?;
        expect.retain(|d| l.binary_search(d).is_ok());
    }
    assert_eq!(candidates, expect);
    // Lexicographic walk order: quick.txt is docid 4.
    assert_eq!(candidates, vec![4]);
    Ok(())
}

#[test]
fn alternation_candidates_are_the_union() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ix = build_corpus(dir.path())?;

    let q = regexp_query("cat|dog")?;
    let candidates = ix.posting_query(&q)?;

    let cat = ix.posting_list(*b"cat")?;
    let dog = ix.posting_list(*b"dog")?;
    let mut expect = [cat, dog].concat();
    expect.sort_unstable();
    expect.dedup();
    assert_eq!(candidates, expect);
    assert_eq!(candidates, vec![1, 2]);
    Ok(())
}

#[test]
fn any_query_never_touches_posting_lists() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ix = build_corpus(dir.path())?;

    let q = regexp_query(".")?;
    assert_eq!(q.op, QueryOp::All);
    assert!(q.trigram.is_empty() && q.sub.is_empty());
    let candidates = ix.posting_query(&q)?;
    assert_eq!(candidates.len() as u32, ix.doc_count());
    Ok(())
}

#[test]
fn candidates_never_miss_a_matching_document() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ix = build_corpus(dir.path())?;

    let patterns = [
        "foobar",
        "cat|dog",
        "a.b",
        "qu+ick",
        "(foo|dog).*",
        "noth[i-k]ng",
        "jum(ps|ping)",
        "interest",
        "a[XYZ]b",
        "(?i)FOOBAR",
    ];
    for pattern in patterns {
        let re = regex::Regex::new(pattern)?;
        let q = regexp_query(pattern)?;
        let candidates = ix.posting_query(&q)?;
        for docid in 0..ix.doc_count() {
            let name = ix.resolve(docid)?;
            let (_, content) = DOCS.iter().find(|(n, _)| *n == name).unwrap();
            if re.is_match(content) {
                assert!(
                    candidates.binary_search(&docid).is_ok(),
                    "pattern {:?} matches doc {} but planner pruned it (query {:?})",
                    pattern,
                    docid,
                    q
                );
            }
        }
    }
    Ok(())
}

#[test]
fn malformed_regex_is_an_input_error() {
    assert!(regexp_query("(unclosed").is_err());
    assert!(regexp_query("a{1000000}{1000000}").is_err());
}
