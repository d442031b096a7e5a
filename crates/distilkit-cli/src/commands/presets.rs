use anyhow::Result;
use clap::Args;

use distilkit_distill::presets::DEFAULT_TEACHER_LAYERS;
use distilkit_distill::{MatchPreset, NAMED_PRESETS};

#[derive(Debug, Clone, Args)]
pub struct PresetsArgs {
    /// Teacher depth to lay the presets out for.
    #[arg(long, default_value_t = DEFAULT_TEACHER_LAYERS)]
    pub teacher_layers: usize,

    /// Show a single preset (any L<n>[t]_<kind> name, not only the listed ones).
    pub name: Option<String>,
}

/// List intermediate-match presets and the layers they pair up.
pub fn run(args: &PresetsArgs) -> Result<()> {
    let names: Vec<&str> = match &args.name {
        Some(n) => vec![n.as_str()],
        None => NAMED_PRESETS.to_vec(),
    };

    println!("{:<22} {:<22} {:<22} {:<8}", "PRESET", "TEACHER LAYERS", "STUDENT LAYERS", "PROJ");
    println!("{}", "-".repeat(78));
    let mut shown = 0;
    for name in names {
        let preset = MatchPreset::parse(name)?;
        // Projections need real sizes only to be built; any pair lists the layers.
        let matches = match preset.matches(args.teacher_layers, Some((1, 1))) {
            Ok(m) => m,
            Err(e) => {
                println!("{:<22} {e}", name);
                continue;
            }
        };
        let teacher: Vec<String> = matches.iter().map(|m| m.layer_t.to_string()).collect();
        let student: Vec<String> = matches.iter().map(|m| m.layer_s.to_string()).collect();
        println!(
            "{:<22} {:<22} {:<22} {:<8}",
            name,
            teacher.join(" "),
            student.join(" "),
            if preset.projected { "linear" } else { "-" }
        );
        shown += 1;
    }
    println!("\n{} preset(s) for a {}-layer teacher", shown, args.teacher_layers);
    Ok(())
}
