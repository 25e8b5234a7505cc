use patchmatch_inpaint::prelude::*;
use std::time::Instant;

fn main() {
    let image = image::open("./image.png").unwrap().to_rgb8();
    let mask = image::open("./mask.png").unwrap().to_luma8();

    let start_time = Instant::now();
    let result = image.patchmatch_inpaint(&mask, 5).unwrap();
    let elapsed_time = start_time.elapsed();

    result.save("./output.png").unwrap();

    println!("Inpainting finished in {:.2?} second(s).", elapsed_time);
}
