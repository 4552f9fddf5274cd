mod common;

use approx::assert_abs_diff_eq;
use image::DynamicImage;
use nalgebra::Matrix3;

use common::{photograph, similarity_transform, textured_card, CARD_HEIGHT, CARD_WIDTH};
use ine_reader::config::{AlignmentStrategy, GeometryLimits, StrategyKind};
use ine_reader::processing::homography::project;
use ine_reader::processing::{Aligner, AlignmentOutcome};
use ine_reader::utils::AlignmentFailure;
use ine_reader::validation::{GeometryViolation, HomographyValidator};
use ine_reader::IdError;

fn light(mut strategy: AlignmentStrategy, max_keypoints: usize) -> AlignmentStrategy {
    strategy.max_keypoints = max_keypoints;
    strategy
}

/// Every interior card point photographed through `truth` must come back
/// to where it started.
fn assert_recovers(recovered: &Matrix3<f64>, truth: &Matrix3<f64>) {
    for y in (60..CARD_HEIGHT - 60).step_by(70) {
        for x in (60..CARD_WIDTH - 60).step_by(90) {
            let card_point = [x as f64, y as f64];
            let scan_point = project(truth, card_point);
            let back = project(recovered, scan_point);
            assert_abs_diff_eq!(back[0], card_point[0], epsilon = 3.0);
            assert_abs_diff_eq!(back[1], card_point[1], epsilon = 3.0);
        }
    }
}

#[test]
fn primary_strategy_recovers_a_rotated_photo() {
    let card = textured_card(17);
    let truth = similarity_transform(3.0, 0.95, 30.0, -5.0);
    let scan = photograph(&card, &truth);

    let aligner = Aligner::new(
        light(AlignmentStrategy::primary(), 3000),
        light(AlignmentStrategy::secondary(), 1500),
    );
    let registration = aligner.align(&scan, &card).into_result().unwrap();

    assert_eq!(registration.strategy, StrategyKind::Primary);
    assert_eq!(registration.image.dimensions(), (CARD_WIDTH, CARD_HEIGHT));
    assert!(registration.inlier_ratio > 0.3, "inlier ratio {}", registration.inlier_ratio);
    assert_recovers(&registration.homography, &truth);
}

#[test]
fn secondary_strategy_takes_over_when_primary_fails() {
    let card = textured_card(29);
    let truth = similarity_transform(-2.0, 1.03, -12.0, 8.0);
    let scan = photograph(&card, &truth);

    let mut impossible = light(AlignmentStrategy::primary(), 3000);
    impossible.min_matches = 1_000_000;
    let aligner = Aligner::new(impossible, light(AlignmentStrategy::secondary(), 1500));

    let registration = aligner.align(&scan, &card).into_result().unwrap();
    assert_eq!(registration.strategy, StrategyKind::Secondary);
    assert_recovers(&registration.homography, &truth);
}

#[test]
fn unrelated_images_exhaust_both_strategies() {
    let blank = DynamicImage::new_rgb8(CARD_WIDTH, CARD_HEIGHT);
    let card = textured_card(5);

    let outcome = Aligner::default().align(&blank, &card);
    let reasons: Vec<StrategyKind> = outcome.reasons().iter().map(|r| r.strategy).collect();
    assert_eq!(reasons, vec![StrategyKind::Primary, StrategyKind::Secondary]);

    match outcome {
        AlignmentOutcome::Failed { primary, secondary } => {
            assert!(matches!(primary.cause, AlignmentFailure::InsufficientFeatures { .. }));
            assert!(matches!(secondary.cause, AlignmentFailure::InsufficientFeatures { .. }));
            let err = IdError::AlignmentExhausted { primary, secondary };
            assert!(err.to_string().contains("primary strategy failed"));
        }
        AlignmentOutcome::Aligned(_) => panic!("a blank scan must not align"),
    }
}

#[test]
fn well_supported_fit_outside_the_scale_limits_is_never_returned() {
    let card = textured_card(23);
    let scan = photograph(&card, &similarity_transform(0.0, 0.9, 20.0, 15.0));

    // Template / scan scale is about 1.11.
    let strict = |strategy: AlignmentStrategy, max_keypoints: usize| {
        let mut strategy = light(strategy, max_keypoints);
        strategy.limits.max_scale = 1.05;
        strategy
    };
    let aligner = Aligner::new(
        strict(AlignmentStrategy::primary(), 3000),
        strict(AlignmentStrategy::secondary(), 1500),
    );

    let outcome = aligner.align(&scan, &card);
    for reason in outcome.reasons() {
        assert!(
            matches!(
                reason.cause,
                AlignmentFailure::InvalidGeometry(GeometryViolation::ScaleOutOfRange { .. })
            ),
            "{}",
            reason
        );
    }
    match outcome.into_result() {
        Err(IdError::AlignmentExhausted { primary, secondary }) => {
            assert_eq!(primary.strategy, StrategyKind::Primary);
            assert_eq!(secondary.strategy, StrategyKind::Secondary);
        }
        other => panic!("expected AlignmentExhausted, got {:?}", other.map(|r| r.strategy)),
    }
}

#[test]
fn fivefold_stretch_is_rejected_regardless_of_support() {
    let stretch = Matrix3::new(5.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
    let result = HomographyValidator::validate(
        &stretch,
        (CARD_WIDTH / 5, CARD_HEIGHT),
        (CARD_WIDTH, CARD_HEIGHT),
        &GeometryLimits::default(),
    );
    assert!(matches!(
        result,
        Err(GeometryViolation::ScaleOutOfRange { value, .. }) if value == 5.0
    ));
}
