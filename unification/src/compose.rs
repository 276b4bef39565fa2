//! Grid composition of one group's frames.
use image::RgbImage;

/// Lays the images out row-major on a grid of `ceil(sqrt(n))` columns,
/// each cell sized to the largest image.
pub(crate) fn compose_grid(images: &[RgbImage]) -> RgbImage {
    if images.is_empty() {
        return RgbImage::new(1, 1);
    }

    let cell_width = images.iter().map(RgbImage::width).max().unwrap_or(1).max(1);
    let cell_height = images.iter().map(RgbImage::height).max().unwrap_or(1).max(1);

    let columns = (images.len() as f64).sqrt().ceil() as u32;
    let rows = (images.len() as u32).div_ceil(columns);

    let mut grid = RgbImage::new(cell_width * columns, cell_height * rows);
    for (index, tile) in images.iter().enumerate() {
        let column = index as u32 % columns;
        let row = index as u32 / columns;
        image::imageops::overlay(
            &mut grid,
            tile,
            i64::from(column * cell_width),
            i64::from(row * cell_height),
        );
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn tile(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn two_tiles_sit_side_by_side() {
        let grid = compose_grid(&[tile(4, 4, 10), tile(4, 4, 20)]);
        assert_eq!(grid.dimensions(), (8, 4));
        assert_eq!(*grid.get_pixel(0, 0), Rgb([10, 10, 10]));
        assert_eq!(*grid.get_pixel(4, 0), Rgb([20, 20, 20]));
    }

    #[test]
    fn five_tiles_wrap_onto_a_second_row() {
        let tiles: Vec<RgbImage> = (0..5).map(|v| tile(2, 2, v * 10)).collect();
        let grid = compose_grid(&tiles);
        // ceil(sqrt(5)) = 3 columns, 2 rows.
        assert_eq!(grid.dimensions(), (6, 4));
        assert_eq!(*grid.get_pixel(0, 2), Rgb([30, 30, 30]));
    }

    #[test]
    fn mixed_sizes_use_the_largest_cell() {
        let grid = compose_grid(&[tile(2, 6, 1), tile(4, 2, 2)]);
        assert_eq!(grid.dimensions(), (8, 6));
    }
}
