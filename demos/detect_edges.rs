/// Detects the edges of an image using a trained structured forest
/// and writes the edge strength as gray image.

extern crate clap;
extern crate env_logger;
#[macro_use]
extern crate error_chain;
extern crate image;
#[macro_use]
extern crate log;
extern crate structured_edges;

use clap::{App, Arg};
use std::time::Instant;
use structured_edges::{MultiScaleDetector, StructuredEdgeDetector, Tensor};

error_chain! {
    links {
        Edges(structured_edges::errors::Error, structured_edges::errors::ErrorKind);
    }

    foreign_links {
        IO(std::io::Error);
        Image(image::ImageError);
    }
}

pub fn main() {
    use std::process::exit;
    if let Err(e) = main_() {
        eprintln!("Error: {}", e);
        for cause in e.iter().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
        exit(-1);
    }
}

fn main_() -> Result<()> {
    env_logger::init();

    let args = App::new("Detect Edges")
        .arg(Arg::with_name("model")
            .short("m")
            .long("model")
            .required(true)
            .takes_value(true)
            .help("Filename of the trained forest (json)"))
        .arg(Arg::with_name("image")
            .short("i")
            .long("image")
            .required(true)
            .takes_value(true)
            .help("Image to detect the edges of"))
        .arg(Arg::with_name("output")
            .short("o")
            .long("output")
            .required(true)
            .takes_value(true)
            .help("Filename of the resulting edge image (png)"))
        .arg(Arg::with_name("multiscale")
            .short("s")
            .long("multiscale")
            .help("Average the edges of the image at three scales"))
        .arg(Arg::with_name("parallel")
            .short("p")
            .long("parallel")
            .help("Use all cores"))
        .get_matches();

    let model = args.value_of("model").ok_or("Invalid parameter for the model")?;
    let input = args.value_of("image").ok_or("Invalid parameter for the image")?;
    let output = args.value_of("output").ok_or("Invalid parameter for the output")?;

    let detector = StructuredEdgeDetector::load(model)?;
    let image = Tensor::from_rgb32f(&image::open(input)?.to_rgb32f());
    info!("Read {}x{} image from {}", image.cols(), image.rows(), input);

    let start = Instant::now();
    let edges = match (args.is_present("multiscale"), args.is_present("parallel")) {
        (true, true) => detector.detect_multiple_scales_parallel(&image)?,
        (true, false) => detector.detect_multiple_scales(&image)?,
        (false, true) => detector.detect_single_scale_parallel(&image)?,
        (false, false) => detector.detect_single_scale(&image)?,
    };
    info!("Detection took {:?}", start.elapsed());

    edges.channel_max().to_gray_image()?.save(output)?;
    info!("Wrote edges to {}", output);
    Ok(())
}
