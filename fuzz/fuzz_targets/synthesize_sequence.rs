#![no_main]

use libfuzzer_sys::fuzz_target;
use watchkeep_core::analysis::parse_sequence;
use watchkeep_core::config::SynthesisConfig;
use watchkeep_core::synthesis::Synthesizer;

// Arbitrary JSON in, never a panic out. The first byte picks N so that
// short inputs still reach the consensus path.
fuzz_target!(|data: &[u8]| {
    let Some((&n, rest)) = data.split_first() else {
        return;
    };
    let Ok(text) = std::str::from_utf8(rest) else {
        return;
    };
    let Ok(entries) = parse_sequence(text) else {
        return;
    };

    let n = usize::from(n % 16) + 1;
    let synthesizer = Synthesizer::new(SynthesisConfig {
        sequence_length: n,
        ..SynthesisConfig::default()
    });
    if let Ok(report) = synthesizer.synthesize(&entries) {
        assert_eq!(report.valid_samples + report.invalid_samples, n);
        assert_eq!(report.reliability.ranking.len(), n);
        assert!((0.0..=1.0).contains(&report.reliability.score));
        for finding in &report.consensus_findings {
            assert!(finding.support * 2 > report.valid_samples);
        }
    }
});
