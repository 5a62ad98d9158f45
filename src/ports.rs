/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::BTreeSet;

use crate::api::PortRange;

/// Returns the numerically smallest port in `range` not present in `used`,
/// or `None` when the range is exhausted (or empty, `start > end`).
///
/// Picking the lowest free port packs allocations densely at the bottom of
/// the range and keeps allocation order deterministic.
pub fn allocate(used: &BTreeSet<i32>, range: &PortRange) -> Option<i32> {
    (range.start..=range.end).find(|port| !used.contains(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: i32, end: i32) -> PortRange {
        PortRange { start, end }
    }

    #[test]
    fn allocates_lowest_free_port() {
        let used = BTreeSet::from([30000, 30002]);
        assert_eq!(allocate(&used, &range(30000, 30010)), Some(30001));
    }

    #[test]
    fn fills_from_the_bottom() {
        let mut used = BTreeSet::new();
        let range = range(30000, 30002);
        for expected in [30000, 30001, 30002] {
            let port = allocate(&used, &range).unwrap();
            assert_eq!(port, expected);
            used.insert(port);
        }
        assert_eq!(allocate(&used, &range), None);
    }

    #[test]
    fn reuses_gaps_left_by_deletions() {
        let mut used = BTreeSet::from([30000, 30001, 30002]);
        used.remove(&30001);
        assert_eq!(allocate(&used, &range(30000, 30002)), Some(30001));
    }

    #[test]
    fn empty_range_never_allocates() {
        assert_eq!(allocate(&BTreeSet::new(), &range(30010, 30000)), None);
    }
}
