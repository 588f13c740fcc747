use crate::errors::SyntaxError;

/// Which adapters a directive or the `--adapters` option addresses.
///
/// `All` is resolved against the live adapter count only when iterated, so
/// parsing never needs to know how many adapters exist. An explicit list is
/// kept sorted and deduplicated; indices beyond the live adapter count are
/// still yielded by [`DeviceSelection::resolve`] and rejected centrally by
/// the validator, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    All,
    Explicit(Vec<i32>),
}

impl DeviceSelection {
    /// Parse an adapter list: `"all"`, or comma-separated indices and
    /// inclusive `first-last` ranges, e.g. `"0,1,3-5"`.
    pub fn parse(text: &str) -> Result<Self, SyntaxError> {
        if text == "all" {
            return Ok(Self::All);
        }

        let mut indices = Vec::new();

        for term in text.split(',') {
            match term.split_once('-') {
                Some((first, last)) => {
                    let first = parse_index(first)?;
                    let last = parse_index(last)?;
                    if first > last {
                        return Err(SyntaxError(format!(
                            "bad range of adapter indices '{term}'"
                        )));
                    }
                    indices.extend(first..=last);
                }
                None => indices.push(parse_index(term)?),
            }
        }

        indices.sort_unstable();
        indices.dedup();

        Ok(Self::Explicit(indices))
    }

    /// Expand the selection against the live adapter count.
    ///
    /// `All` yields `0..device_count`; an explicit list yields its indices
    /// in ascending order, including any that are out of range. The
    /// iterator is finite and can be recreated at will.
    pub fn resolve(&self, device_count: usize) -> SelectionIter<'_> {
        SelectionIter {
            selection: self,
            device_count,
            position: 0,
        }
    }
}

fn parse_index(text: &str) -> Result<i32, SyntaxError> {
    text.parse()
        .map_err(|_| SyntaxError(format!("unable to parse adapter index '{text}'")))
}

pub struct SelectionIter<'a> {
    selection: &'a DeviceSelection,
    device_count: usize,
    position: usize,
}

impl Iterator for SelectionIter<'_> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        let index = match self.selection {
            DeviceSelection::All => {
                if self.position < self.device_count {
                    Some(self.position as i32)
                } else {
                    None
                }
            }
            DeviceSelection::Explicit(indices) => indices.get(self.position).copied(),
        };
        if index.is_some() {
            self.position += 1;
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all() {
        assert_eq!(DeviceSelection::parse("all").unwrap(), DeviceSelection::All);
    }

    #[test]
    fn parse_single_index() {
        assert_eq!(
            DeviceSelection::parse("3").unwrap(),
            DeviceSelection::Explicit(vec![3])
        );
    }

    #[test]
    fn parse_list_with_range_sorts_and_dedups() {
        assert_eq!(
            DeviceSelection::parse("0,2-4,1").unwrap(),
            DeviceSelection::Explicit(vec![0, 1, 2, 3, 4])
        );
        assert_eq!(
            DeviceSelection::parse("2,1-3,2").unwrap(),
            DeviceSelection::Explicit(vec![1, 2, 3])
        );
    }

    #[test]
    fn parse_rejects_empty_input() {
        assert!(DeviceSelection::parse("").is_err());
        assert!(DeviceSelection::parse("0,").is_err());
    }

    #[test]
    fn parse_rejects_reversed_range() {
        assert!(DeviceSelection::parse("3-1").is_err());
    }

    #[test]
    fn parse_rejects_non_integer_terms() {
        assert!(DeviceSelection::parse("a,b").is_err());
        assert!(DeviceSelection::parse("1x").is_err());
        assert!(DeviceSelection::parse("1-2-3").is_err());
    }

    #[test]
    fn parse_is_case_sensitive_for_all() {
        assert!(DeviceSelection::parse("ALL").is_err());
    }

    #[test]
    fn resolve_all_yields_live_range() {
        let sel = DeviceSelection::All;
        assert_eq!(sel.resolve(3).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(sel.resolve(0).count(), 0);
    }

    #[test]
    fn resolve_explicit_keeps_out_of_range_indices() {
        // Bounds checking happens once, in the validator.
        let sel = DeviceSelection::Explicit(vec![0, 5]);
        assert_eq!(sel.resolve(2).collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn resolve_is_restartable() {
        let sel = DeviceSelection::parse("1,3").unwrap();
        assert_eq!(sel.resolve(4).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(sel.resolve(4).collect::<Vec<_>>(), vec![1, 3]);
    }
}
