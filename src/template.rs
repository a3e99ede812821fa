use clap::ValueEnum;
use std::fmt;

/// Extraction template identifier, as exposed on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TemplateId {
    RenalCancer,
    LungCancer,
    Generic,
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TemplateId::RenalCancer => "renal-cancer",
            TemplateId::LungCancer => "lung-cancer",
            TemplateId::Generic => "generic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Enum,
}

/// One field the active template asks the model to fill.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub kind: FieldKind,
    pub enum_values: &'static [&'static str],
    pub required: bool,
    pub example: &'static str,
}

impl FieldSpec {
    const fn text(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        example: &'static str,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            kind: FieldKind::Text,
            enum_values: &[],
            required: false,
            example,
        }
    }

    const fn enumeration(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        enum_values: &'static [&'static str],
        required: bool,
        example: &'static str,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            kind: FieldKind::Enum,
            enum_values,
            required,
            example,
        }
    }
}

/// A complete extraction target: the authoritative field list plus the
/// system prompt that asks for it.
#[derive(Debug, Clone)]
pub struct ExtractionTemplate {
    pub id: TemplateId,
    pub name: &'static str,
    pub description: &'static str,
    pub fields: Vec<FieldSpec>,
    prompt_override: Option<&'static str>,
}

impl ExtractionTemplate {
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|field| field.name).collect()
    }

    /// The system prompt sent with every record. Uses the hand-written
    /// override when one exists, otherwise generates one from the field
    /// specs so new templates only have to declare their fields.
    pub fn system_prompt(&self) -> String {
        if let Some(prompt) = self.prompt_override {
            return prompt.to_string();
        }

        let mut field_lines = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let mut line = format!("    \"{}\": {}", field.name, field.description);
            if field.kind == FieldKind::Enum && !field.enum_values.is_empty() {
                line.push_str(&format!(", allowed values: {}", field.enum_values.join("|")));
            }
            if !field.example.is_empty() {
                line.push_str(&format!(", example: {}", field.example));
            }
            if field.required {
                line.push_str(" (required)");
            }
            field_lines.push(line);
        }

        format!(
            "You are a medical report analysis assistant. Extract structured \
             information from a \"{name}\" report.\n\
             - Respond with strict JSON only; the object must have exactly this shape:\n  \
             {{\n{fields}\n  }}\n\
             - Use an empty string \"\" or null for anything the report does not mention.\n\
             - Extract only information explicitly present in the text; never guess.\n\
             - The output must be a single JSON object with no extra commentary and no Markdown.\n",
            name = self.name,
            fields = field_lines.join(",\n"),
        )
    }
}

const RENAL_CANCER_PROMPT: &str = "\
You are a nuclear-medicine imaging assistant. Extract renal-carcinoma-related \
structured features from the findings section of a PET/CT or bone-scan report.
- Respond with strict JSON only; the object must have exactly this shape:
  {
    \"modality\": \"PETCT|bone scan|SPECT/CT|TOC|other|unknown\",
    \"exam_overview\": string or null,
    \"renal_status\": string or null,
    \"radioactive_findings\": string or null,
    \"metastasis_summary\": string or null,
    \"surgery_history\": string or null,
    \"notes\": string, may be empty
  }
- Every enum value must be exactly one of the listed spellings.
- When the report does not mention something, use \"unknown\"; when a number \
cannot be parsed, use null and explain in notes.
- Field guidance:
  1) exam_overview: summarize exam type and tracer (e.g. \"PET/CT, F-18-FDG\").
  2) renal_status: state of both kidneys and post-surgical status (absence, \
resection, mass size), keeping key sizes and locations.
  3) radioactive_findings: key sites of increased uptake plus SUVmax/size, \
comma separated.
  4) metastasis_summary: suspected metastasis or invasion related to renal \
carcinoma (bone, lung, liver, adrenal, lymph nodes), semicolon separated.
  5) surgery_history: relevant operations or significant history mentioned in \
the text (nephrectomy, metastasis surgery).
- modality from keywords: PET/CT -> \"PETCT\", bone scan/MDP -> \"bone scan\", \
SPECT/CT -> \"SPECT/CT\", TOC-related -> \"TOC\", otherwise \"unknown\".
- notes carries important information that fits nowhere else, or points out \
missing text.
- The output must be a single JSON object with no extra commentary and no \
Markdown.
";

fn renal_cancer_template() -> ExtractionTemplate {
    ExtractionTemplate {
        id: TemplateId::RenalCancer,
        name: "renal carcinoma nuclear medicine report",
        description: "Renal-carcinoma features from PET/CT or bone-scan reports",
        fields: vec![
            FieldSpec::enumeration(
                "modality",
                "exam modality",
                "Exam type: PETCT|bone scan|SPECT/CT|TOC|other|unknown",
                &["PETCT", "bone scan", "SPECT/CT", "TOC", "other", "unknown"],
                true,
                "PETCT",
            ),
            FieldSpec::text(
                "exam_overview",
                "exam overview",
                "Exam type and tracer, e.g. 'PET/CT, F-18-FDG'",
                "PET/CT, F-18-FDG",
            ),
            FieldSpec::text(
                "renal_status",
                "renal status",
                "State of both kidneys and post-surgical status, e.g. 'left kidney absent, right kidney normal'",
                "left kidney absent, right kidney normal",
            ),
            FieldSpec::text(
                "radioactive_findings",
                "radioactive findings",
                "Key sites of increased uptake with SUVmax/size, e.g. 'right adrenal (mildly increased, 3.9), occipital bone (increased, 4.4)'",
                "right adrenal (mildly increased, 3.9), occipital bone (increased, 4.4)",
            ),
            FieldSpec::text(
                "metastasis_summary",
                "metastasis summary",
                "Suspected metastasis/invasion (bone, lung, liver, adrenal, lymph nodes), e.g. 'bone (occipital destruction); lung (nodules)'",
                "bone (occipital destruction); lung (nodules)",
            ),
            FieldSpec::text(
                "surgery_history",
                "surgery history",
                "Relevant operations or significant history, e.g. 'left nephrectomy for carcinoma, splenectomy'",
                "left nephrectomy for carcinoma, splenectomy",
            ),
            FieldSpec::text(
                "notes",
                "notes",
                "Important information that fits nowhere else, or uncertainty",
                "",
            ),
        ],
        prompt_override: Some(RENAL_CANCER_PROMPT),
    }
}

fn lung_cancer_template() -> ExtractionTemplate {
    ExtractionTemplate {
        id: TemplateId::LungCancer,
        name: "lung cancer chest CT report",
        description: "Lung-cancer features from chest CT reports",
        fields: vec![
            FieldSpec::enumeration(
                "exam_type",
                "exam type",
                "CT protocol",
                &["plain", "contrast", "plain+contrast", "unknown"],
                true,
                "contrast",
            ),
            FieldSpec::text(
                "tumor_location",
                "tumor location",
                "Primary lesion location, e.g. 'right upper lobe'",
                "right upper lobe",
            ),
            FieldSpec::text(
                "tumor_size",
                "tumor size",
                "Largest tumor diameter, e.g. '3.5x2.8cm'",
                "3.5x2.8cm",
            ),
            FieldSpec::text(
                "tumor_characteristics",
                "tumor characteristics",
                "Shape, margin, density and other lesion features",
                "lobulated, ill-defined margin, partial spiculation",
            ),
            FieldSpec::enumeration(
                "lymph_node_status",
                "lymph node status",
                "Mediastinal/hilar lymph node assessment",
                &["negative", "positive", "suspicious", "unknown"],
                false,
                "positive",
            ),
            FieldSpec::text(
                "lymph_node_details",
                "lymph node details",
                "Location and size of positive nodes",
                "mediastinal station 4R, short axis 1.2cm",
            ),
            FieldSpec::enumeration(
                "metastasis_status",
                "metastasis status",
                "Distant metastasis assessment",
                &["negative", "positive", "suspicious", "unknown"],
                false,
                "negative",
            ),
            FieldSpec::text(
                "metastasis_sites",
                "metastasis sites",
                "Organs/sites with metastatic disease",
                "liver, bone",
            ),
            FieldSpec::enumeration(
                "pleural_effusion",
                "pleural effusion",
                "Pleural effusion volume",
                &["none", "small", "moderate", "large", "unknown"],
                false,
                "small",
            ),
            FieldSpec::text("notes", "notes", "Other important findings", ""),
        ],
        prompt_override: None,
    }
}

fn generic_template() -> ExtractionTemplate {
    ExtractionTemplate {
        id: TemplateId::Generic,
        name: "general medical exam report",
        description: "Minimal extraction for any exam report",
        fields: vec![
            FieldSpec {
                required: true,
                ..FieldSpec::text(
                    "exam_type",
                    "exam type",
                    "Exam/imaging modality",
                    "CT, MRI, ultrasound",
                )
            },
            FieldSpec::text(
                "key_findings",
                "key findings",
                "The most important findings",
                "multiple hepatic masses",
            ),
            FieldSpec::text(
                "diagnosis_suggestion",
                "diagnosis suggestion",
                "Imaging diagnosis or suggestion",
                "consistent with hepatic metastasis",
            ),
            FieldSpec::text("notes", "notes", "Other important information", ""),
        ],
        prompt_override: None,
    }
}

pub fn get_template(id: TemplateId) -> ExtractionTemplate {
    match id {
        TemplateId::RenalCancer => renal_cancer_template(),
        TemplateId::LungCancer => lung_cancer_template(),
        TemplateId::Generic => generic_template(),
    }
}
