// ============================================================================
// Pixel regions: which pixels participate in an effect
// ============================================================================

use crate::canvas::RasterBuffer;

/// Ordered groups of linear pixel indices (`y * width + x`).
///
/// Produced by [`extract`] or by [`normalize`]; every index lies in
/// `[0, width * height)` of the raster it was derived for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionSet {
    groups: Vec<Vec<u32>>,
}

impl RegionSet {
    pub fn new(groups: Vec<Vec<u32>>) -> Self {
        Self { groups }
    }

    /// One region covering every pixel.
    pub fn all_pixels(pixel_count: usize) -> Self {
        Self {
            groups: vec![(0..pixel_count as u32).collect()],
        }
    }

    pub fn groups(&self) -> &[Vec<u32>] {
        &self.groups
    }

    pub fn into_groups(self) -> Vec<Vec<u32>> {
        self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total index count across all groups.
    pub fn index_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn flat(&self) -> impl Iterator<Item = u32> + '_ {
        self.groups.iter().flatten().copied()
    }
}

/// Region representations accepted from collaborators before posting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionInput {
    /// Canonical shape: sequence of index sequences.
    Groups(Vec<Vec<u32>>),
    /// Legacy: a bare index sequence without the outer wrapper.
    Flat(Vec<u32>),
    /// Legacy: one 0/1 flag per pixel.
    Mask(Vec<u8>),
}

impl From<RegionSet> for RegionInput {
    fn from(set: RegionSet) -> Self {
        RegionInput::Groups(set.into_groups())
    }
}

/// Every pixel whose alpha byte is nonzero, in row-major order, as one region.
///
/// A fully transparent raster yields a single empty region.
pub fn extract(raster: &RasterBuffer) -> RegionSet {
    let indices = raster
        .data()
        .chunks_exact(4)
        .enumerate()
        .filter(|(_, px)| px[3] > 0)
        .map(|(i, _)| i as u32)
        .collect();
    RegionSet::new(vec![indices])
}

/// Convert any tolerated region shape into a canonical [`RegionSet`].
///
/// Idempotent: normalizing a canonical set returns an equal set.
pub fn normalize(input: &RegionInput, pixel_count: usize) -> RegionSet {
    match input {
        RegionInput::Groups(groups) if groups.is_empty() => RegionSet::all_pixels(pixel_count),
        RegionInput::Groups(groups) => RegionSet::new(
            groups
                .iter()
                .map(|g| normalize_group(g, pixel_count))
                .collect(),
        ),
        RegionInput::Flat(indices) => {
            RegionSet::new(vec![normalize_group(indices, pixel_count)])
        }
        RegionInput::Mask(flags) => RegionSet::new(vec![mask_to_indices(
            flags.iter().map(|&f| f != 0),
            pixel_count,
        )]),
    }
}

fn normalize_group(group: &[u32], pixel_count: usize) -> Vec<u32> {
    if looks_like_mask(group, pixel_count) {
        return mask_to_indices(group.iter().map(|&f| f == 1), pixel_count);
    }
    let mut dropped = 0usize;
    let kept: Vec<u32> = group
        .iter()
        .copied()
        .filter(|&i| {
            let ok = (i as usize) < pixel_count;
            if !ok {
                dropped += 1;
            }
            ok
        })
        .collect();
    if dropped > 0 {
        crate::log_warn!("Dropped {} out-of-bounds region indices", dropped);
    }
    kept
}

/// A 0/1 sequence one entry per pixel that cannot be read as an index list:
/// it repeats an index or names a pixel out of range.
fn looks_like_mask(group: &[u32], pixel_count: usize) -> bool {
    group.len() == pixel_count
        && !group.is_empty()
        && group.iter().all(|&v| v <= 1)
        && !is_unique_index_list(group, pixel_count)
}

fn is_unique_index_list(group: &[u32], pixel_count: usize) -> bool {
    let mut seen = vec![false; pixel_count];
    group.iter().all(|&i| match seen.get_mut(i as usize) {
        Some(slot) if !*slot => {
            *slot = true;
            true
        }
        _ => false,
    })
}

fn mask_to_indices(flags: impl Iterator<Item = bool>, pixel_count: usize) -> Vec<u32> {
    flags
        .take(pixel_count)
        .enumerate()
        .filter(|(_, set)| *set)
        .map(|(i, _)| i as u32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster_with_alpha(alphas: &[u8], width: u32) -> RasterBuffer {
        let height = alphas.len() as u32 / width;
        let data = alphas.iter().flat_map(|&a| [10, 20, 30, a]).collect();
        RasterBuffer::from_raw(width, height, data).unwrap()
    }

    #[test]
    fn opaque_image_yields_every_index() {
        let raster = RasterBuffer::filled(10, 10, [255, 0, 0, 255]);
        let regions = extract(&raster);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions.groups()[0], (0..100).collect::<Vec<u32>>());
    }

    #[test]
    fn transparent_image_yields_one_empty_region() {
        let raster = RasterBuffer::new(10, 10);
        let regions = extract(&raster);
        assert_eq!(regions.len(), 1);
        assert!(regions.groups()[0].is_empty());
    }

    #[test]
    fn extraction_uses_binary_alpha_test() {
        let raster = raster_with_alpha(&[0, 1, 0, 255, 128, 0], 3);
        assert_eq!(extract(&raster).groups()[0], vec![1, 3, 4]);
    }

    #[test]
    fn extracted_indices_are_unique_and_in_bounds() {
        let alphas: Vec<u8> = (0..64u32).map(|i| ((i * 37) % 3) as u8).collect();
        let raster = raster_with_alpha(&alphas, 8);
        let regions = extract(&raster);
        let flat: Vec<u32> = regions.flat().collect();
        assert!(flat.len() <= raster.pixel_count());
        assert!(flat.windows(2).all(|w| w[0] < w[1]));
        assert!(flat.iter().all(|&i| (i as usize) < raster.pixel_count()));
    }

    #[test]
    fn legacy_mask_becomes_indices() {
        let set = normalize(&RegionInput::Flat(vec![1, 1, 0, 1]), 4);
        assert_eq!(set.groups(), &[vec![0, 1, 3]]);

        let wrapped = normalize(&RegionInput::Groups(vec![vec![1, 1, 0, 1]]), 4);
        assert_eq!(wrapped, set);

        let explicit = normalize(&RegionInput::Mask(vec![1, 1, 0, 1]), 4);
        assert_eq!(explicit, set);
    }

    #[test]
    fn flat_indices_get_wrapped() {
        let set = normalize(&RegionInput::Flat(vec![2, 5, 7]), 10);
        assert_eq!(set.groups(), &[vec![2, 5, 7]]);
    }

    #[test]
    fn normalization_is_idempotent() {
        let canonical = extract(&RasterBuffer::filled(10, 10, [0, 0, 0, 255]));
        let once = normalize(&RegionInput::from(canonical.clone()), 100);
        assert_eq!(once, canonical);
        let twice = normalize(&RegionInput::from(once.clone()), 100);
        assert_eq!(twice, once);

        let from_mask = normalize(&RegionInput::Flat(vec![0, 1, 1, 0]), 4);
        assert_eq!(normalize(&RegionInput::from(from_mask.clone()), 4), from_mask);
    }

    #[test]
    fn small_sorted_index_lists_are_not_masks() {
        // [0, 1] over two pixels is a valid index list and stays one.
        let set = normalize(&RegionInput::Flat(vec![0, 1]), 2);
        assert_eq!(set.groups(), &[vec![0, 1]]);
    }

    #[test]
    fn unsorted_unique_indices_are_kept_as_given() {
        let canonical = RegionSet::new(vec![vec![1, 0]]);
        let set = normalize(&RegionInput::from(canonical.clone()), 2);
        assert_eq!(set, canonical);
    }

    #[test]
    fn single_pixel_out_of_range_flag_is_a_mask() {
        let set = normalize(&RegionInput::Groups(vec![vec![1]]), 1);
        assert_eq!(set.groups(), &[vec![0]]);
    }

    #[test]
    fn empty_outer_list_covers_all_pixels() {
        let set = normalize(&RegionInput::Groups(Vec::new()), 4);
        assert_eq!(set.groups(), &[vec![0, 1, 2, 3]]);
    }

    #[test]
    fn empty_region_stays_empty() {
        let set = normalize(&RegionInput::Groups(vec![Vec::new()]), 4);
        assert_eq!(set.groups(), &[Vec::<u32>::new()]);
    }

    #[test]
    fn out_of_bounds_indices_are_dropped() {
        let set = normalize(&RegionInput::Flat(vec![3, 40, 9]), 10);
        assert_eq!(set.groups(), &[vec![3, 9]]);
    }
}
