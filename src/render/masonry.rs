use crate::config::EngineConfig;
use uuid::Uuid;

/// One measured card to place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasonryItem {
    pub uuid: Uuid,
    pub pinned: bool,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub uuid: Uuid,
    pub column: usize,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutResult {
    pub columns: usize,
    pub placements: Vec<Placement>,
    /// Top of the unpinned group, when both groups are present.
    pub others_top: Option<f64>,
    pub height: f64,
}

impl LayoutResult {
    pub fn placement(&self, uuid: &Uuid) -> Option<&Placement> {
        self.placements.iter().find(|placement| placement.uuid == *uuid)
    }
}

/// Fixed-width column packing: every card goes to the currently shortest
/// column (leftmost on ties). Pinned cards form their own group above the
/// rest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasonryLayout {
    column_width: f64,
    gap: f64,
}

impl MasonryLayout {
    pub fn new(column_width: f64, gap: f64) -> Self {
        Self {
            column_width: column_width.max(1.0),
            gap: gap.max(0.0),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.column_width_px, config.column_gap_px)
    }

    pub fn columns_for(&self, container_width: f64) -> usize {
        let fit = ((container_width + self.gap) / (self.column_width + self.gap)).floor();
        if fit.is_finite() && fit >= 1.0 {
            fit as usize
        } else {
            1
        }
    }

    pub fn layout(&self, container_width: f64, items: &[MasonryItem]) -> LayoutResult {
        let columns = self.columns_for(container_width);
        let mut result = LayoutResult {
            columns,
            ..LayoutResult::default()
        };

        let pinned = items.iter().filter(|item| item.pinned).collect::<Vec<_>>();
        let others = items.iter().filter(|item| !item.pinned).collect::<Vec<_>>();

        let mut top = 0.0;
        if !pinned.is_empty() {
            top = self.pack(&pinned, columns, 0.0, &mut result.placements);
            if !others.is_empty() {
                top += self.gap;
                result.others_top = Some(top);
            }
        }
        let bottom = if others.is_empty() {
            top
        } else {
            self.pack(&others, columns, top, &mut result.placements)
        };
        result.height = bottom;
        result
    }

    /// Places one group starting at `top` and returns its bottom edge. A
    /// group never occupies more columns than it has cards.
    fn pack(&self, items: &[&MasonryItem], columns: usize, top: f64, placements: &mut Vec<Placement>) -> f64 {
        let lanes = columns.min(items.len()).max(1);
        let mut heights = vec![top; lanes];
        for item in items {
            let column = shortest_column(&heights);
            let y = heights[column];
            placements.push(Placement {
                uuid: item.uuid,
                column,
                x: column as f64 * (self.column_width + self.gap),
                y,
            });
            heights[column] = y + item.height.max(0.0) + self.gap;
        }
        let tallest = heights.iter().copied().fold(top, f64::max);
        if tallest > top {
            tallest - self.gap
        } else {
            top
        }
    }
}

fn shortest_column(heights: &[f64]) -> usize {
    let mut best = 0;
    for (index, height) in heights.iter().enumerate() {
        if *height < heights[best] {
            best = index;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::{MasonryItem, MasonryLayout};
    use uuid::Uuid;

    fn item(height: f64, pinned: bool) -> MasonryItem {
        MasonryItem {
            uuid: Uuid::new_v4(),
            pinned,
            height,
        }
    }

    #[test]
    fn column_count_follows_container_width() {
        let layout = MasonryLayout::new(240.0, 16.0);
        assert_eq!(layout.columns_for(100.0), 1);
        assert_eq!(layout.columns_for(496.0), 2);
        assert_eq!(layout.columns_for(751.0), 2);
        assert_eq!(layout.columns_for(752.0), 3);
    }

    #[test]
    fn cards_go_to_the_shortest_column() {
        let layout = MasonryLayout::new(100.0, 10.0);
        let items = vec![item(100.0, false), item(50.0, false), item(80.0, false), item(30.0, false)];
        let result = layout.layout(330.0, &items);
        assert_eq!(result.columns, 3);
        let columns = result.placements.iter().map(|placement| placement.column).collect::<Vec<_>>();
        assert_eq!(columns, vec![0, 1, 2, 1]);
        let last = result.placement(&items[3].uuid).expect("placed");
        assert_eq!(last.y, 60.0);
        assert_eq!(last.x, 110.0);
        assert_eq!(result.height, 100.0);
    }

    #[test]
    fn pinned_group_sits_above_the_rest() {
        let layout = MasonryLayout::new(100.0, 10.0);
        let items = vec![item(40.0, false), item(70.0, true), item(20.0, false), item(30.0, true)];
        let result = layout.layout(220.0, &items);
        assert_eq!(result.placement(&items[1].uuid).expect("pinned").y, 0.0);
        assert_eq!(result.placement(&items[3].uuid).expect("pinned").y, 0.0);
        assert_eq!(result.others_top, Some(80.0));
        assert_eq!(result.placement(&items[0].uuid).expect("other").y, 80.0);
        assert_eq!(result.placement(&items[2].uuid).expect("other").column, 1);
        assert_eq!(result.height, 120.0);
    }

    #[test]
    fn huge_containers_only_allocate_the_columns_in_use() {
        let layout = MasonryLayout::new(100.0, 10.0);
        let items = vec![item(40.0, false), item(20.0, false)];
        let result = layout.layout(1e30, &items);
        assert!(result.columns > items.len());
        let columns = result.placements.iter().map(|placement| placement.column).collect::<Vec<_>>();
        assert_eq!(columns, vec![0, 1]);
        assert_eq!(result.height, 40.0);
    }

    #[test]
    fn empty_input_has_no_height() {
        let layout = MasonryLayout::new(100.0, 10.0);
        let result = layout.layout(500.0, &[]);
        assert!(result.placements.is_empty());
        assert_eq!(result.height, 0.0);
        assert_eq!(result.others_top, None);
    }
}
