pub const SILICONFLOW_BASE_URL: &str = "https://api.siliconflow.cn/v1";
pub const ALIYUN_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const QIANDUODUO_BASE_URL: &str = "https://api2.aigcbest.top/v1";

pub const API_KEY_ENV: &str = "API_KEY";
pub const API_BASE_URL_ENV: &str = "API_BASE_URL";
pub const API_MODEL_ENV: &str = "API_MODEL";

pub const DEFAULT_OUTPUT_DIR: &str = "outputs";
pub const DEFAULT_REQUEST_DIR: &str = "inputs";

pub const BATCH_ENDPOINT: &str = "/v1/chat/completions";
pub const BATCH_COMPLETION_WINDOW: &str = "24h";
pub const BATCH_REQUEST_FILE_NAME: &str = "batch_requests.jsonl";

pub const JSONL_OUTPUT_FILE_NAME: &str = "extractions.jsonl";
pub const CSV_OUTPUT_FILE_NAME: &str = "extractions.csv";
