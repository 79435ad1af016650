use std::collections::HashSet;

use kestrel_core::Candidate;

/// Ordering key: case-insensitive name with leading underscores sorting after every
/// letter, then the name's length.
pub fn sort_key(name: &str) -> (String, usize) {
    let stripped = name.trim_start_matches('_');
    let underscores = name.len() - stripped.len();
    let mut key = "z".repeat(underscores);
    key.push_str(&stripped.to_lowercase());
    (key, name.len())
}

pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by_cached_key(|candidate| sort_key(&candidate.name));
}

/// `boilerplate` followed by `candidates`, keeping the first candidate of each name.
pub fn mix_boilerplate(boilerplate: &[Candidate], candidates: &[Candidate]) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    boilerplate
        .iter()
        .chain(candidates)
        .filter(|candidate| seen.insert(candidate.name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_names_sort_last() {
        let mut candidates: Vec<Candidate> = ["__init__", "_private", "Beta", "alpha", "a", "zeta"]
            .into_iter()
            .map(|name| Candidate::new(name, "statement"))
            .collect();
        rank(&mut candidates);
        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "alpha", "Beta", "zeta", "_private", "__init__"]);
    }

    #[test]
    fn boilerplate_wins_name_collisions() {
        let boilerplate = vec![Candidate::new("print", "function")];
        let candidates = vec![
            Candidate::new("print", "statement"),
            Candidate::new("price", "statement"),
        ];
        let mixed = mix_boilerplate(&boilerplate, &candidates);
        assert_eq!(mixed.len(), 2);
        assert_eq!(mixed[0].kind, "function");
        assert_eq!(mixed[1].name, "price");
    }
}
