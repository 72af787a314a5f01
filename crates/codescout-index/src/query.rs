//! Lowers a regular expression into a boolean query over trigrams.
//!
//! The resulting `Query` is a conservative approximation: it matches every
//! document the regex could match, usually more. Evaluating it against
//! posting lists prunes the corpus before the expensive byte-level regex
//! runs. The analysis tracks, per subexpression, the exact set of matching
//! strings (bounded), the possible match prefixes and suffixes (bounded),
//! whether the empty string matches, and a trigram query that any match
//! must satisfy; concatenation bridges trigrams across the seam of its
//! operands' suffix and prefix sets.

use anyhow::{Context, Result};
use regex_syntax::hir::{self, Hir, HirKind};

use crate::Trigram;

/// Exact-string sets larger than this collapse into prefix/suffix sets.
const MAX_EXACT: usize = 7;
/// Prefix/suffix sets larger than this are trimmed to shorter strings.
const MAX_SET: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    /// Everything matches.
    All,
    /// Nothing matches.
    None,
    /// Every trigram and subquery must match.
    And,
    /// At least one trigram or subquery must match.
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub op: QueryOp,
    /// Sorted, duplicate-free.
    pub trigram: Vec<Trigram>,
    pub sub: Vec<Query>,
}

impl Query {
    pub fn all() -> Query {
        Query {
            op: QueryOp::All,
            trigram: Vec::new(),
            sub: Vec::new(),
        }
    }

    pub fn none() -> Query {
        Query {
            op: QueryOp::None,
            trigram: Vec::new(),
            sub: Vec::new(),
        }
    }

    pub fn and(self, r: Query) -> Query {
        self.and_or(r, QueryOp::And)
    }

    pub fn or(self, r: Query) -> Query {
        self.and_or(r, QueryOp::Or)
    }

    fn and_or(mut self, mut r: Query, op: QueryOp) -> Query {
        if self.trigram.is_empty() && self.sub.len() == 1 {
            self = self.sub.pop().unwrap();
        }
        if r.trigram.is_empty() && r.sub.len() == 1 {
            r = r.sub.pop().unwrap();
        }

        // If q ⇒ r then q AND r ≡ q and q OR r ≡ r.
        if self.implies(&r) {
            return if op == QueryOp::And { self } else { r };
        }
        if r.implies(&self) {
            return if op == QueryOp::And { r } else { self };
        }

        let q_atom = self.trigram.len() == 1 && self.sub.is_empty();
        let r_atom = r.trigram.len() == 1 && r.sub.is_empty();

        // Merge compatible nodes instead of nesting.
        if self.op == op && (r.op == op || r_atom) {
            self.trigram = union_tris(self.trigram, r.trigram);
            self.sub.append(&mut r.sub);
            return self;
        }
        if r.op == op && q_atom {
            r.trigram = union_tris(r.trigram, self.trigram);
            return r;
        }
        if q_atom && r_atom {
            self.op = op;
            self.trigram = union_tris(self.trigram, r.trigram);
            return self;
        }

        if self.op == op {
            self.sub.push(r);
            return self;
        }
        if r.op == op {
            r.sub.push(self);
            return r;
        }

        // AND of ORs (or OR of ANDs): factor out shared trigrams, e.g.
        // (abc|def) ∧ (abc|ghi) becomes abc ∨ (def ∧ ghi).
        let mut common: Vec<Trigram> = Vec::new();
        {
            let (mut qi, mut ri) = (0usize, 0usize);
            let (mut qw, mut rw) = (0usize, 0usize);
            while qi < self.trigram.len() && ri < r.trigram.len() {
                let (qt, rt) = (self.trigram[qi], r.trigram[ri]);
                if qt < rt {
                    self.trigram[qw] = qt;
                    qw += 1;
                    qi += 1;
                } else if qt > rt {
                    r.trigram[rw] = rt;
                    rw += 1;
                    ri += 1;
                } else {
                    common.push(qt);
                    qi += 1;
                    ri += 1;
                }
            }
            while qi < self.trigram.len() {
                self.trigram[qw] = self.trigram[qi];
                qw += 1;
                qi += 1;
            }
            while ri < r.trigram.len() {
                r.trigram[rw] = r.trigram[ri];
                rw += 1;
                ri += 1;
            }
            self.trigram.truncate(qw);
            r.trigram.truncate(rw);
        }
        if !common.is_empty() {
            let s = self.and_or(r, op);
            let other = if op == QueryOp::And {
                QueryOp::Or
            } else {
                QueryOp::And
            };
            let t = Query {
                op: other,
                trigram: common,
                sub: Vec::new(),
            };
            return t.and_or(s, other);
        }

        Query {
            op,
            trigram: Vec::new(),
            sub: vec![self, r],
        }
    }

    /// Conservative implication test used for boolean simplification.
    fn implies(&self, r: &Query) -> bool {
        if self.op == QueryOp::None || r.op == QueryOp::All {
            return true;
        }
        if self.op == QueryOp::All || r.op == QueryOp::None {
            return false;
        }
        if self.op == QueryOp::And
            || (self.op == QueryOp::Or && self.trigram.len() == 1 && self.sub.is_empty())
        {
            return trigrams_imply(&self.trigram, r);
        }
        if self.op == QueryOp::Or
            && r.op == QueryOp::Or
            && !self.trigram.is_empty()
            && self.sub.is_empty()
            && is_subset(&self.trigram, &r.trigram)
        {
            return true;
        }
        false
    }

    /// AND of `self` and, for every string in `t`, the AND of its trigrams
    /// (ORed over the strings). A string shorter than three bytes cannot
    /// force any trigram, so such a set contributes nothing.
    fn and_trigrams(self, t: &StrSet) -> Query {
        if min_len(t) < 3 {
            return self;
        }
        let mut or = Query::none();
        for tt in t {
            let mut trig: Vec<Trigram> = Vec::with_capacity(tt.len() - 2);
            for i in 0..=tt.len() - 3 {
                trig.push([tt[i], tt[i + 1], tt[i + 2]]);
            }
            trig.sort_unstable();
            trig.dedup();
            or = or.or(Query {
                op: QueryOp::And,
                trigram: trig,
                sub: Vec::new(),
            });
        }
        self.and(or)
    }
}

fn trigrams_imply(t: &[Trigram], q: &Query) -> bool {
    match q.op {
        QueryOp::Or => {
            if q.sub.iter().any(|s| trigrams_imply(t, s)) {
                return true;
            }
            t.iter().any(|x| q.trigram.binary_search(x).is_ok())
        }
        QueryOp::And => {
            if !q.sub.iter().all(|s| trigrams_imply(t, s)) {
                return false;
            }
            q.trigram.iter().all(|x| t.binary_search(x).is_ok())
        }
        _ => false,
    }
}

fn is_subset(a: &[Trigram], b: &[Trigram]) -> bool {
    a.iter().all(|x| b.binary_search(x).is_ok())
}

fn union_tris(mut a: Vec<Trigram>, mut b: Vec<Trigram>) -> Vec<Trigram> {
    a.append(&mut b);
    a.sort_unstable();
    a.dedup();
    a
}

/// A set of byte strings. Prefix sets are kept in lexicographic order,
/// suffix sets in reversed-bytes order so that a string and its extensions
/// are adjacent.
type StrSet = Vec<Vec<u8>>;

fn clean(set: &mut StrSet, is_suffix: bool) {
    if is_suffix {
        set.sort_by(|a, b| a.iter().rev().cmp(b.iter().rev()));
    } else {
        set.sort();
    }
    set.dedup();
}

fn union(mut x: StrSet, mut y: StrSet, is_suffix: bool) -> StrSet {
    x.append(&mut y);
    clean(&mut x, is_suffix);
    x
}

fn cross(x: &StrSet, y: &StrSet, is_suffix: bool) -> StrSet {
    let mut out = Vec::with_capacity(x.len() * y.len());
    for a in x {
        for b in y {
            let mut s = a.clone();
            s.extend_from_slice(b);
            out.push(s);
        }
    }
    clean(&mut out, is_suffix);
    out
}

fn min_len(s: &StrSet) -> usize {
    s.iter().map(|v| v.len()).min().unwrap_or(0)
}

/// Per-subexpression analysis state.
#[derive(Debug, Clone)]
struct RegexInfo {
    /// Whether the subexpression matches the empty string.
    can_empty: bool,
    /// The exact set of matching strings, when small enough to track.
    exact: Option<StrSet>,
    /// When `exact` is gone: possible match prefixes and suffixes.
    prefix: StrSet,
    suffix: StrSet,
    /// Query any match must satisfy, beyond the sets above.
    match_q: Query,
}

fn empty_info() -> RegexInfo {
    RegexInfo {
        can_empty: true,
        exact: Some(vec![Vec::new()]),
        prefix: Vec::new(),
        suffix: Vec::new(),
        match_q: Query::all(),
    }
}

fn no_match_info() -> RegexInfo {
    RegexInfo {
        can_empty: false,
        exact: None,
        prefix: Vec::new(),
        suffix: Vec::new(),
        match_q: Query::none(),
    }
}

fn any_match_info() -> RegexInfo {
    RegexInfo {
        can_empty: true,
        exact: None,
        prefix: vec![Vec::new()],
        suffix: vec![Vec::new()],
        match_q: Query::all(),
    }
}

fn any_char_info() -> RegexInfo {
    RegexInfo {
        can_empty: false,
        exact: None,
        prefix: vec![Vec::new()],
        suffix: vec![Vec::new()],
        match_q: Query::all(),
    }
}

impl RegexInfo {
    /// Fold the exact set's trigrams into the match query.
    fn add_exact(&mut self) {
        if let Some(exact) = self.exact.clone() {
            self.match_q = std::mem::replace(&mut self.match_q, Query::all()).and_trigrams(&exact);
        }
    }

    /// Cap set sizes. With `force`, dissolve the exact set into
    /// prefix/suffix sets unconditionally (done once, at the top level).
    fn simplify(&mut self, force: bool) {
        let oversize = self.exact.as_ref().map(|e| e.len() > MAX_EXACT).unwrap_or(false);
        if self.exact.is_some() && (oversize || force) {
            self.add_exact();
            for s in self.exact.take().unwrap() {
                let n = s.len().min(3);
                self.prefix.push(s[..n].to_vec());
                self.suffix.push(s[s.len() - n..].to_vec());
            }
        }
        if self.exact.is_none() {
            self.simplify_set(false);
            self.simplify_set(true);
        }
    }

    /// Shrink one prefix/suffix set, moving the information it carries into
    /// the match query first. Afterwards every string has at most two bytes
    /// and no string extends another.
    fn simplify_set(&mut self, is_suffix: bool) {
        let mut t = std::mem::take(if is_suffix { &mut self.suffix } else { &mut self.prefix });
        clean(&mut t, is_suffix);

        self.match_q = std::mem::replace(&mut self.match_q, Query::all()).and_trigrams(&t);

        let mut n = 3usize;
        while n == 3 || t.len() > MAX_SET {
            let mut w = 0usize;
            for i in 0..t.len() {
                let mut s = std::mem::take(&mut t[i]);
                if s.len() >= n {
                    if is_suffix {
                        s = s[s.len() - (n - 1)..].to_vec();
                    } else {
                        s.truncate(n - 1);
                    }
                }
                if w == 0 || t[w - 1] != s {
                    t[w] = s;
                    w += 1;
                }
            }
            t.truncate(w);
            clean(&mut t, is_suffix);
            if n == 1 {
                break;
            }
            n -= 1;
        }

        // "ab" being a possible prefix makes "abc" redundant.
        let mut out: StrSet = Vec::with_capacity(t.len());
        for s in t {
            let redundant = match out.last() {
                None => false,
                Some(last) => {
                    if is_suffix {
                        s.ends_with(last)
                    } else {
                        s.starts_with(last)
                    }
                }
            };
            if !redundant {
                out.push(s);
            }
        }
        *(if is_suffix { &mut self.suffix } else { &mut self.prefix }) = out;
    }
}

fn concat_info(mut x: RegexInfo, mut y: RegexInfo) -> RegexInfo {
    let xm = std::mem::replace(&mut x.match_q, Query::all());
    let ym = std::mem::replace(&mut y.match_q, Query::all());
    let mut xy = RegexInfo {
        can_empty: x.can_empty && y.can_empty,
        exact: None,
        prefix: Vec::new(),
        suffix: Vec::new(),
        match_q: xm.and(ym),
    };

    match (&x.exact, &y.exact) {
        (Some(xe), Some(ye)) => xy.exact = Some(cross(xe, ye, false)),
        _ => {
            if let Some(xe) = &x.exact {
                xy.prefix = cross(xe, &y.prefix, false);
            } else {
                xy.prefix = x.prefix.clone();
                if x.can_empty {
                    xy.prefix = union(xy.prefix, y.prefix.clone(), false);
                }
            }
            if let Some(ye) = &y.exact {
                xy.suffix = cross(&x.suffix, ye, true);
            } else {
                xy.suffix = y.suffix.clone();
                if y.can_empty {
                    xy.suffix = union(xy.suffix, x.suffix.clone(), true);
                }
            }
        }
    }

    // Every long-enough string in suffix(x)·prefix(y) crosses the seam, so
    // one of its trigrams must appear even though neither side records it.
    if x.exact.is_none()
        && y.exact.is_none()
        && x.suffix.len() <= MAX_SET
        && y.prefix.len() <= MAX_SET
        && min_len(&x.suffix) + min_len(&y.prefix) >= 3
    {
        let bridge = cross(&x.suffix, &y.prefix, false);
        xy.match_q = std::mem::replace(&mut xy.match_q, Query::all()).and_trigrams(&bridge);
    }

    xy.simplify(false);
    xy
}

fn alternate_info(mut x: RegexInfo, mut y: RegexInfo) -> RegexInfo {
    let mut xy = RegexInfo {
        can_empty: x.can_empty || y.can_empty,
        exact: None,
        prefix: Vec::new(),
        suffix: Vec::new(),
        match_q: Query::all(),
    };
    match (x.exact.clone(), y.exact.clone()) {
        (Some(xe), Some(ye)) => xy.exact = Some(union(xe, ye, false)),
        (Some(xe), None) => {
            xy.prefix = union(xe.clone(), y.prefix.clone(), false);
            xy.suffix = union(xe, y.suffix.clone(), true);
            x.add_exact();
        }
        (None, Some(ye)) => {
            xy.prefix = union(x.prefix.clone(), ye.clone(), false);
            xy.suffix = union(x.suffix.clone(), ye, true);
            y.add_exact();
        }
        (None, None) => {
            xy.prefix = union(x.prefix.clone(), y.prefix.clone(), false);
            xy.suffix = union(x.suffix.clone(), y.suffix.clone(), true);
        }
    }
    let xm = std::mem::replace(&mut x.match_q, Query::all());
    let ym = std::mem::replace(&mut y.match_q, Query::all());
    xy.match_q = xm.or(ym);
    xy.simplify(false);
    xy
}

fn analyze(h: &Hir) -> RegexInfo {
    use hir::Literal;
    let mut info = match h.kind() {
        HirKind::Empty | HirKind::Anchor(_) | HirKind::WordBoundary(_) => return empty_info(),
        HirKind::Literal(lit) => {
            let bytes = match lit {
                Literal::Unicode(c) => {
                    let mut buf = [0u8; 4];
                    c.encode_utf8(&mut buf).as_bytes().to_vec()
                }
                Literal::Byte(b) => vec![*b],
            };
            RegexInfo {
                can_empty: false,
                exact: Some(vec![bytes]),
                prefix: Vec::new(),
                suffix: Vec::new(),
                match_q: Query::all(),
            }
        }
        HirKind::Class(class) => return analyze_class(class),
        HirKind::Group(g) => return analyze(&g.hir),
        HirKind::Concat(subs) => {
            let mut info = empty_info();
            for sub in subs {
                info = concat_info(info, analyze(sub));
            }
            info
        }
        HirKind::Alternation(subs) => match subs.split_first() {
            None => no_match_info(),
            Some((first, rest)) => {
                let mut info = analyze(first);
                for sub in rest {
                    info = alternate_info(info, analyze(sub));
                }
                info
            }
        },
        HirKind::Repetition(rep) => {
            use hir::RepetitionKind::*;
            use hir::RepetitionRange::*;
            let min = match &rep.kind {
                ZeroOrOne | ZeroOrMore => 0,
                OneOrMore => 1,
                Range(Exactly(n)) | Range(AtLeast(n)) | Range(Bounded(n, _)) => *n,
            };
            if matches!(&rep.kind, ZeroOrOne) {
                alternate_info(analyze(&rep.hir), empty_info())
            } else if min == 0 {
                // Nothing is forced; assume the worst.
                return any_match_info();
            } else {
                // At least one occurrence: prefixes and suffixes survive,
                // exactness does not.
                let mut info = analyze(&rep.hir);
                if let Some(exact) = info.exact.take() {
                    info.prefix = exact.clone();
                    info.suffix = exact;
                    clean(&mut info.suffix, true);
                }
                info
            }
        }
    };
    info.simplify(false);
    info
}

fn analyze_class(class: &hir::Class) -> RegexInfo {
    let mut exact: StrSet = Vec::new();
    match class {
        hir::Class::Unicode(cu) => {
            let mut n: u64 = 0;
            for r in cu.iter() {
                n += (r.end() as u32 - r.start() as u32 + 1) as u64;
                if n > 4 {
                    return any_char_info();
                }
            }
            if n == 0 {
                return no_match_info();
            }
            for r in cu.iter() {
                for c in (r.start() as u32)..=(r.end() as u32) {
                    if let Some(ch) = char::from_u32(c) {
                        let mut buf = [0u8; 4];
                        exact.push(ch.encode_utf8(&mut buf).as_bytes().to_vec());
                    }
                }
            }
        }
        hir::Class::Bytes(cb) => {
            let mut n: u64 = 0;
            for r in cb.iter() {
                n += (r.end() - r.start() + 1) as u64;
                if n > 4 {
                    return any_char_info();
                }
            }
            if n == 0 {
                return no_match_info();
            }
            for r in cb.iter() {
                for b in r.start()..=r.end() {
                    exact.push(vec![b]);
                }
            }
        }
    }
    clean(&mut exact, false);
    let mut info = RegexInfo {
        can_empty: false,
        exact: Some(exact),
        prefix: Vec::new(),
        suffix: Vec::new(),
        match_q: Query::all(),
    };
    info.simplify(false);
    info
}

/// Compute the trigram query for a regular expression.
pub fn regexp_query(pattern: &str) -> Result<Query> {
    regex::Regex::new(pattern).with_context(|| format!("malformed regex {:?}", pattern))?;
    let hir = regex_syntax::Parser::new()
        .parse(pattern)
        .with_context(|| format!("malformed regex {:?}", pattern))?;
    Ok(query_for_hir(&hir))
}

/// The query for an already-parsed regex.
pub fn query_for_hir(hir: &Hir) -> Query {
    let mut info = analyze(hir);
    info.simplify(true);
    info.add_exact();
    info.match_q
}

/// If `pattern` is a plain literal (possibly grouped), its bytes.
/// Positional queries only apply to these.
pub fn as_literal(pattern: &str) -> Option<Vec<u8>> {
    let hir = regex_syntax::Parser::new().parse(pattern).ok()?;
    literal_bytes(&hir)
}

fn literal_bytes(h: &Hir) -> Option<Vec<u8>> {
    use hir::Literal;
    match h.kind() {
        HirKind::Empty => Some(Vec::new()),
        HirKind::Literal(Literal::Unicode(c)) => {
            let mut buf = [0u8; 4];
            Some(c.encode_utf8(&mut buf).as_bytes().to_vec())
        }
        HirKind::Literal(Literal::Byte(b)) => Some(vec![*b]),
        HirKind::Group(g) => literal_bytes(&g.hir),
        HirKind::Concat(subs) => {
            let mut out = Vec::new();
            for sub in subs {
                out.extend(literal_bytes(sub)?);
            }
            Some(out)
        }
        _ => None,
    }
}
